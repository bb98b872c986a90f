//! Concrete upstream adapters. The routing core only ever sees the
//! [`crate::LanguageModel`] capability; everything provider-specific
//! lives here.

mod openai_compatible;

pub use openai_compatible::OpenAiCompatibleModel;

use crate::types::ProviderId;

/// Default OpenAI-compatible endpoint for each provider.
pub fn default_base_url(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::OpenAi => "https://api.openai.com/v1",
        ProviderId::Anthropic => "https://api.anthropic.com/v1",
        ProviderId::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
    }
}

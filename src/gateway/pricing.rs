use std::collections::HashMap;

use crate::types::ProviderId;

/// USD per 1K tokens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k_usd: f64,
    pub output_per_1k_usd: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct PricingEntry {
    pub provider: ProviderId,
    pub pricing: ModelPricing,
}

#[derive(Clone, Copy, Debug)]
pub struct ResolvedPricing {
    pub pricing: ModelPricing,
    /// False when the model id was absent and the conservative default applied.
    pub known: bool,
}

/// Immutable model id -> (provider, pricing) table.
#[derive(Clone, Debug)]
pub struct PricingTable {
    models: HashMap<String, PricingEntry>,
    default_pricing: ModelPricing,
}

impl PricingTable {
    pub fn builtin() -> Self {
        let mut table = Self {
            models: HashMap::new(),
            // Priced like a frontier model so unknown ids never under-bill.
            default_pricing: ModelPricing {
                input_per_1k_usd: 0.01,
                output_per_1k_usd: 0.03,
            },
        };

        let openai: &[(&str, f64, f64)] = &[
            ("gpt-4o", 0.0025, 0.01),
            ("gpt-4o-mini", 0.000_15, 0.0006),
            ("gpt-4.1", 0.002, 0.008),
            ("gpt-4.1-mini", 0.0004, 0.0016),
            ("o1", 0.015, 0.06),
            ("o3-mini", 0.0011, 0.0044),
        ];
        let anthropic: &[(&str, f64, f64)] = &[
            ("claude-3-5-sonnet-latest", 0.003, 0.015),
            ("claude-3-5-haiku-latest", 0.0008, 0.004),
            ("claude-3-opus-latest", 0.015, 0.075),
        ];
        let google: &[(&str, f64, f64)] = &[
            ("gemini-1.5-pro", 0.001_25, 0.005),
            ("gemini-1.5-flash", 0.000_075, 0.0003),
            ("gemini-2.0-flash", 0.0001, 0.0004),
        ];

        for (provider, entries) in [
            (ProviderId::OpenAi, openai),
            (ProviderId::Anthropic, anthropic),
            (ProviderId::Google, google),
        ] {
            for (model, input, output) in entries {
                table = table.with_model(*model, provider, *input, *output);
            }
        }
        table
    }

    pub fn with_model(
        mut self,
        model: impl Into<String>,
        provider: ProviderId,
        input_per_1k_usd: f64,
        output_per_1k_usd: f64,
    ) -> Self {
        self.models.insert(
            model.into(),
            PricingEntry {
                provider,
                pricing: ModelPricing {
                    input_per_1k_usd,
                    output_per_1k_usd,
                },
            },
        );
        self
    }

    pub fn resolve(&self, model: &str) -> ResolvedPricing {
        match self.models.get(model) {
            Some(entry) => ResolvedPricing {
                pricing: entry.pricing,
                known: true,
            },
            None => ResolvedPricing {
                pricing: self.default_pricing,
                known: false,
            },
        }
    }

    /// The provider owning a model id: exact table entry first, then the
    /// conventional id-prefix families.
    pub fn provider_for(&self, model: &str) -> Option<ProviderId> {
        if let Some(entry) = self.models.get(model) {
            return Some(entry.provider);
        }
        let lowered = model.to_ascii_lowercase();
        if lowered.starts_with("gpt-")
            || lowered.starts_with("o1")
            || lowered.starts_with("o3")
            || lowered.starts_with("chatgpt")
        {
            return Some(ProviderId::OpenAi);
        }
        if lowered.starts_with("claude") {
            return Some(ProviderId::Anthropic);
        }
        if lowered.starts_with("gemini") {
            return Some(ProviderId::Google);
        }
        None
    }

    /// `(input/1000)·rate_in + (output/1000)·rate_out`, plus whether the
    /// model id was priced from the table.
    pub fn cost_usd(&self, model: &str, input_tokens: u32, output_tokens: u32) -> (f64, bool) {
        let resolved = self.resolve(model);
        let cost = f64::from(input_tokens) / 1000.0 * resolved.pricing.input_per_1k_usd
            + f64::from(output_tokens) / 1000.0 * resolved.pricing.output_per_1k_usd;
        (cost, resolved.known)
    }
}

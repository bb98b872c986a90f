mod env;
mod error;
mod stream;

pub mod embedding;
pub mod gateway;
pub mod model;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{GatewayError, Result};
pub use model::{ChunkStream, LanguageModel, StreamHandle};
pub use stream::cancellable_stream;
pub use types::{
    GenerateRequest, GenerateResponse, Message, ProviderId, ProviderState, RequestMetadata,
    RetryAttempt, Role, RoutingStrategy, StreamChunk, Usage,
};

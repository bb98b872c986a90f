use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::oneshot;

use crate::types::{GenerateRequest, GenerateResponse, StreamChunk, Usage};
use crate::Result;

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// A live upstream stream plus the usage totals that become available
/// only after the final chunk. Callers must drain `chunks` before awaiting
/// `usage`; adapters resolve the sender when the stream ends.
pub struct StreamHandle {
    pub chunks: ChunkStream,
    pub usage: oneshot::Receiver<Usage>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> crate::types::ProviderId;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;

    async fn stream(&self, request: GenerateRequest) -> Result<StreamHandle>;
}

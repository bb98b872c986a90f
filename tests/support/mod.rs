use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::oneshot;

use relay_llm::gateway::config::{GatewayConfig, RoutingConfig};
use relay_llm::gateway::{CircuitConfig, FallbackConfig, RateLimitConfig, SemanticCacheConfig, TimeoutConfig};
use relay_llm::types::{
    GenerateRequest, GenerateResponse, ProviderId, RoutingStrategy, StreamChunk, Usage,
};
use relay_llm::{GatewayError, LanguageModel, Result, StreamHandle};

pub fn test_config(providers: &[ProviderId]) -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        api_keys: providers
            .iter()
            .map(|provider| (*provider, "test-key".to_string()))
            .collect(),
        routing: RoutingConfig {
            strategy: RoutingStrategy::Balanced,
            latency_window: 100,
            ema_alpha: 0.3,
        },
        fallback: FallbackConfig {
            max_retries: 1,
            backoff_base_ms: 1,
        },
        circuit: CircuitConfig {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        },
        rate_limit: RateLimitConfig::default(),
        timeouts: TimeoutConfig::default(),
        cache: SemanticCacheConfig {
            enabled: false,
            ..SemanticCacheConfig::default()
        },
        cost_alert_threshold_usd: 1_000.0,
        shutdown_drain_ms: 1_000,
        json_logs: false,
    }
}

/// Always answers with a fixed completion.
pub struct StaticModel {
    pub provider: ProviderId,
    pub text: String,
    pub usage: Usage,
    pub calls: Arc<AtomicU32>,
}

impl StaticModel {
    pub fn new(provider: ProviderId, text: &str, usage: Usage) -> Self {
        Self {
            provider,
            text: text.to_string(),
            usage,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl LanguageModel for StaticModel {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    async fn generate(&self, _request: GenerateRequest) -> Result<GenerateResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerateResponse {
            text: self.text.clone(),
            usage: self.usage,
        })
    }

    async fn stream(&self, _request: GenerateRequest) -> Result<StreamHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<Result<StreamChunk>> = self
            .text
            .chars()
            .map(|ch| {
                Ok(StreamChunk {
                    delta: ch.to_string(),
                })
            })
            .collect();
        let (usage_tx, usage_rx) = oneshot::channel();
        let _ = usage_tx.send(self.usage);
        Ok(StreamHandle {
            chunks: stream::iter(chunks).boxed(),
            usage: usage_rx,
        })
    }
}

/// Always fails with the given upstream status.
pub struct FailingModel {
    pub provider: ProviderId,
    pub status: u16,
    pub calls: Arc<AtomicU32>,
}

impl FailingModel {
    pub fn new(provider: ProviderId, status: u16) -> Self {
        Self {
            provider,
            status,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn error(&self) -> GatewayError {
        GatewayError::Upstream {
            provider: self.provider,
            status: Some(self.status),
            message: format!("status {}", self.status),
        }
    }
}

#[async_trait]
impl LanguageModel for FailingModel {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    async fn generate(&self, _request: GenerateRequest) -> Result<GenerateResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }

    async fn stream(&self, _request: GenerateRequest) -> Result<StreamHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }
}

/// Sleeps before answering; used to trip the timeout governor.
pub struct SleepyModel {
    pub provider: ProviderId,
    pub delay: Duration,
}

#[async_trait]
impl LanguageModel for SleepyModel {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    async fn generate(&self, _request: GenerateRequest) -> Result<GenerateResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(GenerateResponse {
            text: "late".to_string(),
            usage: Usage::new(1, 1),
        })
    }

    async fn stream(&self, _request: GenerateRequest) -> Result<StreamHandle> {
        tokio::time::sleep(self.delay).await;
        let (usage_tx, usage_rx) = oneshot::channel();
        let _ = usage_tx.send(Usage::new(1, 1));
        Ok(StreamHandle {
            chunks: stream::iter(Vec::<Result<StreamChunk>>::new()).boxed(),
            usage: usage_rx,
        })
    }
}

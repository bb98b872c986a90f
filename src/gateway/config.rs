use std::collections::HashMap;

use crate::env;
use crate::types::{ProviderId, RoutingStrategy};

use super::fallback::FallbackConfig;
use super::ratelimit::RateLimitConfig;
use super::registry::CircuitConfig;
use super::semantic_cache::SemanticCacheConfig;
use super::timeout::TimeoutConfig;

/// Routing knobs not covered by the component configs.
#[derive(Clone, Copy, Debug)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    pub latency_window: usize,
    pub ema_alpha: f64,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub api_keys: HashMap<ProviderId, String>,
    pub routing: RoutingConfig,
    pub fallback: FallbackConfig,
    pub circuit: CircuitConfig,
    pub rate_limit: RateLimitConfig,
    pub timeouts: TimeoutConfig,
    pub cache: SemanticCacheConfig,
    pub cost_alert_threshold_usd: f64,
    pub shutdown_drain_ms: u64,
    pub json_logs: bool,
}

impl GatewayConfig {
    /// Assembles the full configuration from the process environment.
    /// Malformed numeric values warn and keep the default; providers are
    /// enabled by the presence of their credential.
    pub fn from_env() -> Self {
        let mut api_keys = HashMap::new();
        for (provider, key) in [
            (ProviderId::OpenAi, "OPENAI_API_KEY"),
            (ProviderId::Anthropic, "ANTHROPIC_API_KEY"),
            (ProviderId::Google, "GOOGLE_API_KEY"),
        ] {
            if let Some(value) = env::var(key) {
                api_keys.insert(provider, value);
            }
        }

        let strategy = env::var("ROUTING_STRATEGY")
            .and_then(|raw| RoutingStrategy::parse(&raw))
            .unwrap_or_default();

        let mut per_provider = HashMap::new();
        for (provider, key) in [
            (ProviderId::OpenAi, "OPENAI_TIMEOUT_MS"),
            (ProviderId::Anthropic, "ANTHROPIC_TIMEOUT_MS"),
            (ProviderId::Google, "GOOGLE_TIMEOUT_MS"),
        ] {
            if env::var(key).is_some() {
                per_provider.insert(provider, env::parse_or(key, 30_000));
            }
        }

        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            api_keys,
            routing: RoutingConfig {
                strategy,
                latency_window: env::parse_or("LATENCY_WINDOW_SIZE", 100usize),
                ema_alpha: env::parse_or("LATENCY_EMA_ALPHA", 0.3f64),
            },
            fallback: FallbackConfig {
                max_retries: env::parse_or("MAX_RETRIES", 2u32),
                backoff_base_ms: env::parse_or("RETRY_BACKOFF_BASE_MS", 500u64),
            },
            circuit: CircuitConfig {
                failure_threshold: env::parse_or("CIRCUIT_FAILURE_THRESHOLD", 5u32),
                cooldown_ms: env::parse_or("CIRCUIT_COOLDOWN_MS", 30_000u64),
            },
            rate_limit: RateLimitConfig {
                capacity: env::parse_or("RATE_LIMIT_CAPACITY", 60u32),
                refill_per_sec: env::parse_or("RATE_LIMIT_REFILL_PER_SEC", 1.0f64),
            },
            timeouts: TimeoutConfig {
                default_ms: env::parse_or("DEFAULT_TIMEOUT_MS", 30_000u64),
                max_allowed_ms: env::parse_or("MAX_ALLOWED_TIMEOUT_MS", 120_000u64),
                per_provider,
            },
            cache: SemanticCacheConfig {
                enabled: env::flag_enabled("CACHE_ENABLED", true),
                url: env::var("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
                ttl_seconds: env::parse_or("CACHE_TTL_SECONDS", 3_600u64),
                similarity_threshold: env::parse_or("CACHE_SIMILARITY_THRESHOLD", 0.15f64),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|| "text-embedding-3-small".to_string()),
                embedding_dimensions: env::parse_or("EMBEDDING_DIMENSIONS", 1536usize),
            },
            cost_alert_threshold_usd: env::parse_or("COST_ALERT_THRESHOLD_USD", 100.0f64),
            shutdown_drain_ms: env::parse_or("SHUTDOWN_DRAIN_MS", 10_000u64),
            json_logs: env::var("NODE_ENV")
                .map(|value| value != "development")
                .unwrap_or(true),
        }
    }

    pub fn enabled_providers(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .into_iter()
            .filter(|provider| self.api_keys.contains_key(provider))
            .collect()
    }
}

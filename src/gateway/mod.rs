//! The request-routing engine: provider health, ranking, failover,
//! admission control, cost accounting, and the semantic cache.

pub mod config;
pub mod cost;
pub mod fallback;
pub mod http;
pub mod latency;
pub mod openai;
pub mod pricing;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod rules;
pub mod selector;
pub mod semantic_cache;
pub mod timeout;

pub use config::GatewayConfig;
pub use cost::{CostRecord, CostSummary, CostTracker};
pub use fallback::{FallbackConfig, FallbackOutcome};
pub use latency::{LatencyStats, LatencyTracker};
pub use pricing::PricingTable;
pub use ratelimit::{Admission, RateLimitConfig, TokenBucketLimiter};
pub use registry::{CircuitConfig, ProviderRegistry};
pub use rules::{RankedProvider, RulesEngine};
pub use selector::ModelSelector;
pub use semantic_cache::{SemanticCache, SemanticCacheConfig};
pub use timeout::{RequestDeadline, TimeoutConfig, TimeoutGovernor};

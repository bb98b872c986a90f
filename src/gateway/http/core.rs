use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use uuid::Uuid;

use crate::gateway::config::GatewayConfig;
use crate::gateway::cost::CostTracker;
use crate::gateway::latency::LatencyTracker;
use crate::gateway::openai;
use crate::gateway::pricing::PricingTable;
use crate::gateway::ratelimit::TokenBucketLimiter;
use crate::gateway::registry::ProviderRegistry;
use crate::gateway::rules::{CapabilityMap, RulesEngine};
use crate::gateway::selector::ModelSelector;
use crate::gateway::semantic_cache::SemanticCache;
use crate::gateway::timeout::TimeoutGovernor;
use crate::model::LanguageModel;
use crate::types::ProviderId;
use crate::GatewayError;

#[derive(Default)]
pub(crate) struct Counters {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub errors_validation: AtomicU64,
    pub errors_timeout: AtomicU64,
    pub errors_rate_limited: AtomicU64,
    pub errors_provider: AtomicU64,
    pub errors_internal: AtomicU64,
}

impl Counters {
    pub(crate) fn record_error(&self, error: &GatewayError) {
        let counter = match error {
            GatewayError::Validation(_) => &self.errors_validation,
            GatewayError::Timeout { .. } => &self.errors_timeout,
            GatewayError::RateLimited { .. } => &self.errors_rate_limited,
            GatewayError::NoProviders { .. } | GatewayError::AllFailed { .. } => {
                &self.errors_provider
            }
            GatewayError::Upstream { .. } | GatewayError::Internal(_) => &self.errors_internal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) selector: Arc<ModelSelector>,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) limiter: Arc<TokenBucketLimiter>,
    pub(crate) latency: Arc<LatencyTracker>,
    pub(crate) cost: Arc<CostTracker>,
    pub(crate) pricing: Arc<PricingTable>,
    pub(crate) governor: Arc<TimeoutGovernor>,
    pub(crate) cache: Option<Arc<SemanticCache>>,
    pub(crate) models: Arc<HashMap<ProviderId, Arc<dyn LanguageModel>>>,
    pub(crate) counters: Arc<Counters>,
}

impl AppState {
    pub fn new(config: &GatewayConfig) -> Self {
        let enabled = config.enabled_providers();
        let pricing = Arc::new(PricingTable::builtin());
        let registry = Arc::new(ProviderRegistry::new(config.circuit, &enabled));
        let limiter = Arc::new(TokenBucketLimiter::new(config.rate_limit, &enabled));
        let latency = Arc::new(LatencyTracker::new(
            config.routing.latency_window,
            config.routing.ema_alpha,
        ));
        let selector = Arc::new(ModelSelector::new(
            registry.clone(),
            limiter.clone(),
            latency.clone(),
            RulesEngine::new(pricing.clone(), CapabilityMap::builtin()),
            config.routing.strategy,
            config.fallback,
        ));

        Self {
            selector,
            registry,
            limiter,
            latency,
            cost: Arc::new(CostTracker::new(
                pricing.clone(),
                config.cost_alert_threshold_usd,
            )),
            pricing,
            governor: Arc::new(TimeoutGovernor::new(config.timeouts.clone())),
            cache: None,
            models: Arc::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        let mut models = (*self.models).clone();
        models.insert(model.provider(), model);
        self.models = Arc::new(models);
        self
    }

    pub fn with_cache(mut self, cache: SemanticCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(super::chat::chat_completions))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/metrics/costs", get(metrics_costs))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.registry.enabled_providers().is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable", "reason": "no providers enabled" })),
        )
            .into_response();
    }

    if let Some(cache) = state.cache.as_ref() {
        let ping = tokio::time::timeout(Duration::from_secs(2), cache.ping()).await;
        if !matches!(ping, Ok(Ok(()))) {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable", "reason": "redis unreachable" })),
            )
                .into_response();
        }
    }

    Json(serde_json::json!({ "status": "ready" })).into_response()
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let counters = &state.counters;
    let mut providers = serde_json::Map::new();
    for health in state.registry.snapshot() {
        let stats = state.latency.stats(health.provider);
        providers.insert(
            health.provider.as_str().to_string(),
            serde_json::json!({
                "enabled": health.enabled,
                "available": health.available,
                "consecutive_failures": health.consecutive_failures,
                "rate_limit_remaining": state.limiter.remaining(health.provider),
                "latency": {
                    "sample_count": stats.sample_count,
                    "ema_ms": stats.ema_ms,
                    "p50_ms": stats.p50_ms,
                    "p95_ms": stats.p95_ms,
                    "p99_ms": stats.p99_ms,
                },
            }),
        );
    }

    Json(serde_json::json!({
        "requests": counters.requests.load(Ordering::Relaxed),
        "cache_hits": counters.cache_hits.load(Ordering::Relaxed),
        "cache_misses": counters.cache_misses.load(Ordering::Relaxed),
        "errors": {
            "validation": counters.errors_validation.load(Ordering::Relaxed),
            "timeout": counters.errors_timeout.load(Ordering::Relaxed),
            "rate_limited": counters.errors_rate_limited.load(Ordering::Relaxed),
            "provider": counters.errors_provider.load(Ordering::Relaxed),
            "internal": counters.errors_internal.load(Ordering::Relaxed),
        },
        "providers": providers,
    }))
}

async fn metrics_costs(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.cost.summary()).unwrap_or_else(|_| serde_json::json!({})))
}

pub(crate) fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn request_id_from(headers: &HeaderMap) -> String {
    extract_header(headers, "x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub(crate) fn error_response(error: &GatewayError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(openai::error_body(error))).into_response();
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

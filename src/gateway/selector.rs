use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::fallback::{self, FallbackConfig, FallbackOutcome};
use super::latency::LatencyTracker;
use super::ratelimit::{Admission, TokenBucketLimiter};
use super::registry::{AdmitDecision, ProviderRegistry};
use super::rules::{RankedProvider, RulesEngine};
use crate::types::{ProviderState, RequestMetadata, RoutingStrategy};
use crate::{GatewayError, Result};

/// Orchestrates registry -> rules -> fallback for one dispatch.
pub struct ModelSelector {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<TokenBucketLimiter>,
    latency: Arc<LatencyTracker>,
    rules: RulesEngine,
    strategy: RoutingStrategy,
    fallback: FallbackConfig,
}

impl ModelSelector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        limiter: Arc<TokenBucketLimiter>,
        latency: Arc<LatencyTracker>,
        rules: RulesEngine,
        strategy: RoutingStrategy,
        fallback: FallbackConfig,
    ) -> Self {
        Self {
            registry,
            limiter,
            latency,
            rules,
            strategy,
            fallback,
        }
    }

    /// Point-in-time provider view: circuit state joined with rate-limit
    /// headroom and the latency signal.
    pub fn provider_states(&self) -> Vec<ProviderState> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|health| ProviderState {
                provider: health.provider,
                enabled: health.enabled,
                available: health.available,
                consecutive_failures: health.consecutive_failures,
                rate_limit_remaining: self.limiter.remaining(health.provider),
                last_failure_ms: health.last_failure_ms,
                cooldown_until_ms: health.cooldown_until_ms,
                latency_ema_ms: self.latency.ema_ms(health.provider),
            })
            .collect()
    }

    /// Rank, filter by admissibility, and order: score descending, then
    /// latency EMA ascending with unsampled providers last.
    pub fn candidates(&self, meta: &RequestMetadata) -> Result<Vec<RankedProvider>> {
        let states = self.provider_states();
        let strategy = meta.strategy_override.unwrap_or(self.strategy);
        let ranked = self.rules.evaluate(meta, &states, strategy);

        let by_provider: HashMap<_, _> = states
            .iter()
            .map(|state| (state.provider, state))
            .collect();

        let mut admissible: Vec<RankedProvider> = ranked
            .into_iter()
            .filter(|candidate| {
                by_provider
                    .get(&candidate.provider)
                    .map(|state| state.available && state.rate_limit_remaining > 0)
                    .unwrap_or(false)
            })
            .collect();

        if admissible.is_empty() {
            return Err(GatewayError::NoProviders {
                model: meta.model.clone(),
            });
        }

        admissible.sort_by(|a, b| {
            let ema = |candidate: &RankedProvider| {
                by_provider
                    .get(&candidate.provider)
                    .and_then(|state| state.latency_ema_ms)
                    .unwrap_or(f64::INFINITY)
            };
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    ema(a)
                        .partial_cmp(&ema(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        Ok(admissible)
    }

    pub fn select(&self, meta: &RequestMetadata) -> Result<RankedProvider> {
        Ok(self.candidates(meta)?.remove(0))
    }

    /// Runs `exec` through the fallback chain. Health and latency
    /// bookkeeping happens inside the per-candidate wrapper, so the next
    /// candidate always observes the updated registry state.
    pub async fn select_with_fallback<T, F, Fut>(
        &self,
        meta: &RequestMetadata,
        cancel: &CancellationToken,
        timeout_ms: u64,
        exec: F,
    ) -> Result<FallbackOutcome<T>>
    where
        F: Fn(RankedProvider) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let candidates = self.candidates(meta)?;
        debug!(
            model = %meta.model,
            candidates = candidates.len(),
            "dispatching with fallback"
        );

        let registry = self.registry.clone();
        let limiter = self.limiter.clone();
        let latency = self.latency.clone();
        let exec = &exec;

        fallback::run(
            &candidates,
            self.fallback,
            cancel,
            timeout_ms,
            move |candidate: RankedProvider| {
                let registry = registry.clone();
                let limiter = limiter.clone();
                let latency = latency.clone();
                async move {
                    if let Admission::Denied { retry_after_ms } =
                        limiter.try_acquire(candidate.provider)
                    {
                        return Err(GatewayError::RateLimited { retry_after_ms });
                    }
                    if registry.admit(candidate.provider) == AdmitDecision::Rejected {
                        return Err(GatewayError::Internal(format!(
                            "provider {} is cooling down",
                            candidate.provider
                        )));
                    }

                    let started = Instant::now();
                    match exec(candidate.clone()).await {
                        Ok(value) => {
                            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                            registry.report_success(candidate.provider);
                            latency.record(
                                candidate.provider,
                                &candidate.model,
                                elapsed_ms,
                                elapsed_ms,
                                true,
                            );
                            Ok(value)
                        }
                        Err(err) => {
                            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                            registry.report_failure(candidate.provider);
                            latency.record(
                                candidate.provider,
                                &candidate.model,
                                elapsed_ms,
                                elapsed_ms,
                                false,
                            );
                            Err(err)
                        }
                    }
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::pricing::PricingTable;
    use crate::gateway::ratelimit::RateLimitConfig;
    use crate::gateway::registry::CircuitConfig;
    use crate::gateway::rules::CapabilityMap;
    use crate::types::ProviderId;

    fn selector(enabled: &[ProviderId]) -> ModelSelector {
        let pricing = Arc::new(PricingTable::builtin());
        ModelSelector::new(
            Arc::new(ProviderRegistry::new(CircuitConfig::default(), enabled)),
            Arc::new(TokenBucketLimiter::new(RateLimitConfig::default(), enabled)),
            Arc::new(LatencyTracker::new(100, 0.3)),
            RulesEngine::new(pricing, CapabilityMap::builtin()),
            RoutingStrategy::Balanced,
            FallbackConfig {
                max_retries: 1,
                backoff_base_ms: 1,
            },
        )
    }

    fn meta(model: &str) -> RequestMetadata {
        RequestMetadata {
            model: model.to_string(),
            messages: vec![crate::types::Message::user("hello")],
            stream: false,
            strategy_override: None,
        }
    }

    #[test]
    fn open_circuits_are_filtered_out() {
        let selector = selector(&[ProviderId::OpenAi, ProviderId::Anthropic]);
        for _ in 0..5 {
            selector.registry.report_failure(ProviderId::OpenAi);
        }
        let candidates = selector.candidates(&meta("gpt-4o")).expect("candidates");
        assert!(candidates
            .iter()
            .all(|candidate| candidate.provider != ProviderId::OpenAi));
    }

    #[test]
    fn empty_admissible_set_is_no_providers() {
        let selector = selector(&[ProviderId::OpenAi]);
        for _ in 0..5 {
            selector.registry.report_failure(ProviderId::OpenAi);
        }
        let err = selector.candidates(&meta("gpt-4o")).unwrap_err();
        assert!(matches!(err, GatewayError::NoProviders { .. }));
    }

    #[test]
    fn equal_scores_tiebreak_on_latency_ema() {
        let selector = selector(&[ProviderId::OpenAi, ProviderId::Anthropic]);
        // Same total, so the EMA and scores match per provider; the slower
        // provider must sort after the faster one.
        selector
            .latency
            .record(ProviderId::OpenAi, "gpt-4o", 10.0, 400.0, true);
        selector.latency.record(
            ProviderId::Anthropic,
            "claude-3-5-sonnet-latest",
            10.0,
            80.0,
            true,
        );
        let candidates = selector.candidates(&meta("gpt-4o")).expect("candidates");
        let openai_idx = candidates
            .iter()
            .position(|c| c.provider == ProviderId::OpenAi)
            .unwrap();
        let anthropic_idx = candidates
            .iter()
            .position(|c| c.provider == ProviderId::Anthropic)
            .unwrap();
        if (candidates[openai_idx].score - candidates[anthropic_idx].score).abs() < f64::EPSILON {
            assert!(anthropic_idx < openai_idx);
        }
    }

    #[tokio::test]
    async fn failures_update_health_before_the_next_candidate_runs() {
        let selector = selector(&[ProviderId::OpenAi, ProviderId::Anthropic]);
        let registry = selector.registry.clone();

        let outcome = selector
            .select_with_fallback(
                &meta("gpt-4o"),
                &CancellationToken::new(),
                1_000,
                |candidate| {
                    let registry = registry.clone();
                    async move {
                        if candidate.provider == ProviderId::OpenAi {
                            Err(GatewayError::Upstream {
                                provider: candidate.provider,
                                status: Some(500),
                                message: "boom".to_string(),
                            })
                        } else {
                            // The earlier failures must already be visible.
                            let openai = registry
                                .snapshot()
                                .into_iter()
                                .find(|s| s.provider == ProviderId::OpenAi)
                                .expect("openai state");
                            assert!(openai.consecutive_failures >= 1);
                            Ok(candidate.provider)
                        }
                    }
                },
            )
            .await
            .expect("fallback success");

        assert_eq!(outcome.value, ProviderId::Anthropic);
        assert_eq!(outcome.providers_tried, 2);
    }

    #[tokio::test]
    async fn success_seeds_the_latency_signal() {
        let selector = selector(&[ProviderId::OpenAi]);
        selector
            .select_with_fallback(
                &meta("gpt-4o"),
                &CancellationToken::new(),
                1_000,
                |_| async move { Ok::<_, GatewayError>(()) },
            )
            .await
            .expect("dispatch");
        assert!(selector.latency.ema_ms(ProviderId::OpenAi).is_some());
    }
}

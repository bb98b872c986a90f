use std::collections::HashMap;
use std::sync::Arc;

use super::pricing::PricingTable;
use crate::types::{ProviderId, ProviderState, RequestMetadata, RoutingStrategy};

/// A scored candidate. The list returned by [`RulesEngine::evaluate`] is a
/// ranking; admission filtering happens at the selector.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedProvider {
    pub provider: ProviderId,
    pub model: String,
    pub score: f64,
}

#[derive(Clone, Copy, Debug)]
struct Weights {
    price: f64,
    latency: f64,
    health: f64,
}

fn weights(strategy: RoutingStrategy) -> Weights {
    match strategy {
        RoutingStrategy::Cost => Weights {
            price: 0.7,
            latency: 0.1,
            health: 0.2,
        },
        RoutingStrategy::Latency => Weights {
            price: 0.1,
            latency: 0.7,
            health: 0.2,
        },
        RoutingStrategy::Balanced | RoutingStrategy::CapabilityFirst => Weights {
            price: 0.4,
            latency: 0.4,
            health: 0.2,
        },
    }
}

/// Explicit equivalence map: requested model id -> the model each provider
/// serves it with. Providers absent from an entry cannot serve that id
/// (unless they own it outright).
#[derive(Clone, Debug, Default)]
pub struct CapabilityMap {
    equivalents: HashMap<String, Vec<(ProviderId, String)>>,
}

impl CapabilityMap {
    pub fn builtin() -> Self {
        let mut map = Self::default();
        map.insert(
            "gpt-4o",
            &[
                (ProviderId::OpenAi, "gpt-4o"),
                (ProviderId::Anthropic, "claude-3-5-sonnet-latest"),
                (ProviderId::Google, "gemini-1.5-pro"),
            ],
        );
        map.insert(
            "gpt-4o-mini",
            &[
                (ProviderId::OpenAi, "gpt-4o-mini"),
                (ProviderId::Anthropic, "claude-3-5-haiku-latest"),
                (ProviderId::Google, "gemini-1.5-flash"),
            ],
        );
        map
    }

    pub fn insert(&mut self, model: &str, entries: &[(ProviderId, &str)]) {
        self.equivalents.insert(
            model.to_string(),
            entries
                .iter()
                .map(|(provider, resolved)| (*provider, resolved.to_string()))
                .collect(),
        );
    }

    fn resolve(&self, model: &str, provider: ProviderId) -> Option<String> {
        let entry = self.equivalents.get(model)?;
        entry
            .iter()
            .find(|(candidate, _)| *candidate == provider)
            .map(|(_, resolved)| resolved.clone())
    }
}

pub struct RulesEngine {
    pricing: Arc<PricingTable>,
    capabilities: CapabilityMap,
}

struct Candidate {
    provider: ProviderId,
    model: String,
    price_per_1k: f64,
    latency_ema_ms: Option<f64>,
    consecutive_failures: u32,
}

impl RulesEngine {
    pub fn new(pricing: Arc<PricingTable>, capabilities: CapabilityMap) -> Self {
        Self {
            pricing,
            capabilities,
        }
    }

    /// Resolve which model `provider` would serve `model` with, or `None`
    /// when the provider has no capable model. The explicit equivalence map
    /// wins; otherwise the provider owning the id serves it verbatim. The
    /// capability-first strategy skips the ownership fallback for ids the
    /// map knows nothing about being served cross-provider anyway.
    fn resolve_model(
        &self,
        model: &str,
        provider: ProviderId,
        strategy: RoutingStrategy,
    ) -> Option<String> {
        if let Some(resolved) = self.capabilities.resolve(model, provider) {
            return Some(resolved);
        }
        if strategy == RoutingStrategy::CapabilityFirst
            && self.capabilities.equivalents.contains_key(model)
        {
            return None;
        }
        (self.pricing.provider_for(model) == Some(provider)).then(|| model.to_string())
    }

    pub fn evaluate(
        &self,
        meta: &RequestMetadata,
        states: &[ProviderState],
        strategy: RoutingStrategy,
    ) -> Vec<RankedProvider> {
        let candidates: Vec<Candidate> = states
            .iter()
            .filter(|state| state.enabled)
            .filter_map(|state| {
                let model = self.resolve_model(&meta.model, state.provider, strategy)?;
                let pricing = self.pricing.resolve(&model).pricing;
                Some(Candidate {
                    provider: state.provider,
                    model,
                    price_per_1k: pricing.input_per_1k_usd + pricing.output_per_1k_usd,
                    latency_ema_ms: state.latency_ema_ms,
                    consecutive_failures: state.consecutive_failures,
                })
            })
            .collect();

        if candidates.is_empty() {
            return Vec::new();
        }

        let prices: Vec<f64> = candidates.iter().map(|c| c.price_per_1k).collect();
        let failures: Vec<f64> = candidates
            .iter()
            .map(|c| f64::from(c.consecutive_failures))
            .collect();
        let latencies: Vec<f64> = candidates
            .iter()
            .filter_map(|c| c.latency_ema_ms)
            .collect();

        let weights = weights(strategy);
        let mut ranked: Vec<RankedProvider> = candidates
            .iter()
            .map(|candidate| {
                let price_score = lower_is_better(candidate.price_per_1k, &prices);
                // Providers with no samples yet score neutral so a cold
                // provider is neither favored nor starved.
                let latency_score = candidate
                    .latency_ema_ms
                    .map(|ema| lower_is_better(ema, &latencies))
                    .unwrap_or(0.5);
                let health_score =
                    lower_is_better(f64::from(candidate.consecutive_failures), &failures);

                RankedProvider {
                    provider: candidate.provider,
                    model: candidate.model.clone(),
                    score: weights.price * price_score
                        + weights.latency * latency_score
                        + weights.health * health_score,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }
}

/// Normalize into [0, 1] across the candidate set, higher = better.
fn lower_is_better(value: f64, all: &[f64]) -> f64 {
    let min = all.iter().copied().fold(f64::INFINITY, f64::min);
    let max = all.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < f64::EPSILON {
        return 1.0;
    }
    1.0 - (value - min) / (max - min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(provider: ProviderId, failures: u32, ema: Option<f64>) -> ProviderState {
        ProviderState {
            provider,
            enabled: true,
            available: true,
            consecutive_failures: failures,
            rate_limit_remaining: 10,
            last_failure_ms: None,
            cooldown_until_ms: None,
            latency_ema_ms: ema,
        }
    }

    fn engine() -> RulesEngine {
        RulesEngine::new(Arc::new(PricingTable::builtin()), CapabilityMap::builtin())
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
    fn cost_strategy_ranks_the_cheapest_equivalent_first() {
        let states = vec![
            state(ProviderId::OpenAi, 0, Some(100.0)),
            state(ProviderId::Anthropic, 0, Some(100.0)),
            state(ProviderId::Google, 0, Some(100.0)),
        ];
        let ranked = engine().evaluate(&meta("gpt-4o"), &states, RoutingStrategy::Cost);
        assert_eq!(ranked.len(), 3);
        // gemini-1.5-pro is the cheapest of the three equivalents.
        assert_eq!(ranked[0].provider, ProviderId::Google);
        assert_eq!(ranked[0].model, "gemini-1.5-pro");
    }

    #[test]
    fn latency_strategy_prefers_the_fastest_provider() {
        let states = vec![
            state(ProviderId::OpenAi, 0, Some(40.0)),
            state(ProviderId::Anthropic, 0, Some(900.0)),
            state(ProviderId::Google, 0, Some(500.0)),
        ];
        let ranked = engine().evaluate(&meta("gpt-4o"), &states, RoutingStrategy::Latency);
        assert_eq!(ranked[0].provider, ProviderId::OpenAi);
    }

    #[test]
    fn failing_providers_sink_in_the_ranking() {
        // Pin both providers to the same price so only health separates them.
        let mut capabilities = CapabilityMap::default();
        capabilities.insert(
            "shared-model",
            &[
                (ProviderId::OpenAi, "gpt-4o"),
                (ProviderId::Anthropic, "gpt-4o"),
            ],
        );
        let engine = RulesEngine::new(Arc::new(PricingTable::builtin()), capabilities);

        let states = vec![
            state(ProviderId::OpenAi, 4, Some(100.0)),
            state(ProviderId::Anthropic, 0, Some(100.0)),
        ];
        let ranked = engine.evaluate(&meta("shared-model"), &states, RoutingStrategy::Balanced);
        assert_eq!(ranked[0].provider, ProviderId::Anthropic);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn providers_without_a_capable_model_are_dropped() {
        let states = vec![
            state(ProviderId::OpenAi, 0, None),
            state(ProviderId::Anthropic, 0, None),
        ];
        let ranked = engine().evaluate(
            &meta("claude-3-opus-latest"),
            &states,
            RoutingStrategy::Balanced,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].provider, ProviderId::Anthropic);
        assert_eq!(ranked[0].model, "claude-3-opus-latest");
    }

    #[test]
    fn disabled_providers_never_rank() {
        let mut disabled = state(ProviderId::OpenAi, 0, None);
        disabled.enabled = false;
        let ranked = engine().evaluate(&meta("gpt-4o"), &[disabled], RoutingStrategy::Balanced);
        assert!(ranked.is_empty());
    }

    #[test]
    fn unknown_latency_scores_neutral() {
        let states = vec![
            state(ProviderId::OpenAi, 0, None),
            state(ProviderId::Anthropic, 0, Some(50.0)),
        ];
        let ranked = engine().evaluate(&meta("gpt-4o"), &states, RoutingStrategy::Latency);
        // The sampled provider takes the top latency score; the cold one is
        // not pinned to zero.
        assert_eq!(ranked[0].provider, ProviderId::Anthropic);
        assert!(ranked[1].score > 0.0);
    }
}

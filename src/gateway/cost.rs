use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;

use super::pricing::PricingTable;
use crate::types::{ProviderId, Usage};
use crate::utils::now_millis;

const RECENT_CAPACITY: usize = 50;

#[derive(Clone, Debug, Serialize)]
pub struct CostRecord {
    pub provider: ProviderId,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    /// False when the model was billed at the conservative default rate.
    pub priced_from_table: bool,
    pub ts_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
    pub recent: Vec<CostRecord>,
}

#[derive(Default)]
struct CostState {
    total_usd: f64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    by_provider: BTreeMap<String, f64>,
    by_model: BTreeMap<String, f64>,
    recent: VecDeque<CostRecord>,
    alerted: bool,
}

/// Cumulative USD accounting across every completed dispatch.
pub struct CostTracker {
    pricing: Arc<PricingTable>,
    alert_threshold_usd: f64,
    state: Mutex<CostState>,
}

impl CostTracker {
    pub fn new(pricing: Arc<PricingTable>, alert_threshold_usd: f64) -> Self {
        Self {
            pricing,
            alert_threshold_usd,
            state: Mutex::new(CostState::default()),
        }
    }

    pub fn record(&self, provider: ProviderId, model: &str, usage: Usage) -> CostRecord {
        let (cost_usd, priced_from_table) =
            self.pricing
                .cost_usd(model, usage.input_tokens, usage.output_tokens);
        let record = CostRecord {
            provider,
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd,
            priced_from_table,
            ts_ms: now_millis(),
        };

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.total_usd += cost_usd;
        state.total_input_tokens += u64::from(usage.input_tokens);
        state.total_output_tokens += u64::from(usage.output_tokens);
        *state
            .by_provider
            .entry(provider.as_str().to_string())
            .or_insert(0.0) += cost_usd;
        *state.by_model.entry(model.to_string()).or_insert(0.0) += cost_usd;

        state.recent.push_back(record.clone());
        while state.recent.len() > RECENT_CAPACITY {
            state.recent.pop_front();
        }

        // The latch fires once for the process lifetime and never resets.
        if !state.alerted && state.total_usd >= self.alert_threshold_usd {
            state.alerted = true;
            warn!(
                total_usd = state.total_usd,
                threshold_usd = self.alert_threshold_usd,
                "cumulative spend crossed the alert threshold"
            );
        }

        record
    }

    pub fn alert_latched(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .alerted
    }

    /// Value-copy snapshot safe to serialize without holding the lock.
    pub fn summary(&self) -> CostSummary {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        CostSummary {
            total_usd: state.total_usd,
            total_input_tokens: state.total_input_tokens,
            total_output_tokens: state.total_output_tokens,
            by_provider: state.by_provider.clone(),
            by_model: state.by_model.clone(),
            recent: state.recent.iter().cloned().collect(),
        }
    }
}

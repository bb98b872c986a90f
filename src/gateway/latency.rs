use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::types::ProviderId;
use crate::utils::now_millis;

#[derive(Clone, Debug, Serialize)]
pub struct LatencyRecord {
    pub provider: ProviderId,
    pub model: String,
    pub ttfb_ms: f64,
    pub total_ms: f64,
    pub success: bool,
    pub ts_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LatencyStats {
    pub sample_count: usize,
    pub ema_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub last_updated_ms: u64,
}

#[derive(Debug, Default)]
struct ProviderLatency {
    samples: VecDeque<f64>,
    ema_ms: Option<f64>,
    records: VecDeque<LatencyRecord>,
    last_updated_ms: u64,
}

/// Rolling latency window per provider. The EMA and percentiles cover
/// successful attempts only; failures are kept in the record ring for
/// introspection and never move the routing signal.
pub struct LatencyTracker {
    window: usize,
    alpha: f64,
    inner: Mutex<HashMap<ProviderId, ProviderLatency>>,
}

impl LatencyTracker {
    pub fn new(window: usize, alpha: f64) -> Self {
        Self {
            window: window.max(1),
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        provider: ProviderId,
        model: &str,
        ttfb_ms: f64,
        total_ms: f64,
        success: bool,
    ) {
        if !ttfb_ms.is_finite() || !total_ms.is_finite() || ttfb_ms < 0.0 || total_ms < 0.0 {
            warn!(%provider, ttfb_ms, total_ms, "dropping non-finite latency sample");
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = inner.entry(provider).or_default();

        entry.records.push_back(LatencyRecord {
            provider,
            model: model.to_string(),
            ttfb_ms,
            total_ms,
            success,
            ts_ms: now_millis(),
        });
        while entry.records.len() > self.window {
            entry.records.pop_front();
        }

        if !success {
            return;
        }

        entry.samples.push_back(total_ms);
        while entry.samples.len() > self.window {
            entry.samples.pop_front();
        }
        entry.ema_ms = Some(match entry.ema_ms {
            Some(ema) => self.alpha * total_ms + (1.0 - self.alpha) * ema,
            None => total_ms,
        });
        entry.last_updated_ms = now_millis();
    }

    pub fn ema_ms(&self, provider: ProviderId) -> Option<f64> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.get(&provider).and_then(|entry| entry.ema_ms)
    }

    pub fn stats(&self, provider: ProviderId) -> LatencyStats {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = inner.get(&provider) else {
            return LatencyStats::default();
        };
        if entry.samples.is_empty() {
            return LatencyStats::default();
        }

        let mut sorted: Vec<f64> = entry.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        LatencyStats {
            sample_count: sorted.len(),
            ema_ms: entry.ema_ms.map(round2).unwrap_or(0.0),
            p50_ms: nearest_rank(&sorted, 50.0),
            p95_ms: nearest_rank(&sorted, 95.0),
            p99_ms: nearest_rank(&sorted, 99.0),
            last_updated_ms: entry.last_updated_ms,
        }
    }

    pub fn recent_records(&self, provider: ProviderId) -> Vec<LatencyRecord> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .get(&provider)
            .map(|entry| entry.records.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (percentile / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

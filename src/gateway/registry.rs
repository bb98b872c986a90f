use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

use crate::types::ProviderId;
use crate::utils::now_millis;

#[derive(Clone, Copy, Debug)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

const COOLDOWN_MAX_MS: u64 = 300_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmitDecision {
    Admitted { probe: bool },
    Rejected,
}

#[derive(Debug)]
struct HealthEntry {
    enabled: bool,
    consecutive_failures: u32,
    last_failure_ms: Option<u64>,
    cooldown_until_ms: Option<u64>,
    current_cooldown_ms: u64,
    half_open_inflight: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub provider: ProviderId,
    pub enabled: bool,
    pub available: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<u64>,
}

/// Per-provider circuit breaker.
///
/// Closed: failures are counted, requests admitted. Open: every admission is
/// rejected until the cooldown passes. Half-open: exactly one probe crosses;
/// the permit is taken test-and-set under the registry lock, so concurrent
/// callers observe a single winner. A successful probe closes the circuit; a
/// failed probe reopens it with a doubled (capped) cooldown.
pub struct ProviderRegistry {
    config: CircuitConfig,
    inner: Mutex<HashMap<ProviderId, HealthEntry>>,
}

impl ProviderRegistry {
    pub fn new(config: CircuitConfig, enabled: &[ProviderId]) -> Self {
        let mut inner = HashMap::new();
        for provider in ProviderId::ALL {
            inner.insert(
                provider,
                HealthEntry {
                    enabled: enabled.contains(&provider),
                    consecutive_failures: 0,
                    last_failure_ms: None,
                    cooldown_until_ms: None,
                    current_cooldown_ms: config.cooldown_ms,
                    half_open_inflight: false,
                },
            );
        }
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    pub fn admit(&self, provider: ProviderId) -> AdmitDecision {
        self.admit_at(provider, now_millis())
    }

    pub fn admit_at(&self, provider: ProviderId, now_ms: u64) -> AdmitDecision {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = inner.get_mut(&provider) else {
            return AdmitDecision::Rejected;
        };
        if !entry.enabled {
            return AdmitDecision::Rejected;
        }

        match entry.cooldown_until_ms {
            None => AdmitDecision::Admitted { probe: false },
            Some(until) if now_ms < until => AdmitDecision::Rejected,
            Some(_) => {
                if entry.half_open_inflight {
                    return AdmitDecision::Rejected;
                }
                entry.half_open_inflight = true;
                debug!(%provider, "admitting half-open probe");
                AdmitDecision::Admitted { probe: true }
            }
        }
    }

    pub fn report_success(&self, provider: ProviderId) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = inner.get_mut(&provider) else {
            return;
        };
        entry.consecutive_failures = 0;
        entry.cooldown_until_ms = None;
        entry.current_cooldown_ms = self.config.cooldown_ms;
        entry.half_open_inflight = false;
    }

    pub fn report_failure(&self, provider: ProviderId) {
        self.report_failure_at(provider, now_millis());
    }

    pub fn report_failure_at(&self, provider: ProviderId, now_ms: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = inner.get_mut(&provider) else {
            return;
        };

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_failure_ms = Some(now_ms);

        if entry.half_open_inflight {
            entry.half_open_inflight = false;
            entry.current_cooldown_ms =
                entry.current_cooldown_ms.saturating_mul(2).min(COOLDOWN_MAX_MS);
            entry.cooldown_until_ms = Some(now_ms.saturating_add(entry.current_cooldown_ms));
            warn!(
                %provider,
                cooldown_ms = entry.current_cooldown_ms,
                "half-open probe failed; circuit reopened"
            );
            return;
        }

        let open = entry
            .cooldown_until_ms
            .map(|until| now_ms < until)
            .unwrap_or(false);
        if !open && entry.consecutive_failures >= self.config.failure_threshold {
            entry.cooldown_until_ms = Some(now_ms.saturating_add(entry.current_cooldown_ms));
            warn!(
                %provider,
                failures = entry.consecutive_failures,
                cooldown_ms = entry.current_cooldown_ms,
                "failure threshold reached; circuit opened"
            );
        }
    }

    pub fn is_available(&self, provider: ProviderId) -> bool {
        self.is_available_at(provider, now_millis())
    }

    pub fn is_available_at(&self, provider: ProviderId, now_ms: u64) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .get(&provider)
            .map(|entry| {
                entry.enabled
                    && entry
                        .cooldown_until_ms
                        .map(|until| now_ms >= until)
                        .unwrap_or(true)
            })
            .unwrap_or(false)
    }

    pub fn enabled_providers(&self) -> Vec<ProviderId> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ProviderId::ALL
            .into_iter()
            .filter(|provider| inner.get(provider).map(|entry| entry.enabled).unwrap_or(false))
            .collect()
    }

    /// Value-copy view for the selector and the metrics endpoint.
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        self.snapshot_at(now_millis())
    }

    pub fn snapshot_at(&self, now_ms: u64) -> Vec<HealthSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ProviderId::ALL
            .into_iter()
            .filter_map(|provider| {
                let entry = inner.get(&provider)?;
                Some(HealthSnapshot {
                    provider,
                    enabled: entry.enabled,
                    available: entry.enabled
                        && entry
                            .cooldown_until_ms
                            .map(|until| now_ms >= until)
                            .unwrap_or(true),
                    consecutive_failures: entry.consecutive_failures,
                    last_failure_ms: entry.last_failure_ms,
                    cooldown_until_ms: entry.cooldown_until_ms,
                })
            })
            .collect()
    }
}

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::types::ProviderId;
use crate::utils::task::AbortOnDrop;

#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    pub default_ms: u64,
    pub max_allowed_ms: u64,
    pub per_provider: HashMap<ProviderId, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: 30_000,
            max_allowed_ms: 120_000,
            per_provider: HashMap::new(),
        }
    }
}

/// A scheduled request deadline. The token fires when the timer elapses;
/// dropping the deadline disarms the timer on every exit path.
pub struct RequestDeadline {
    pub timeout_ms: u64,
    token: CancellationToken,
    _timer: AbortOnDrop,
}

impl RequestDeadline {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel outstanding work early (client went away).
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

pub struct TimeoutGovernor {
    config: TimeoutConfig,
}

impl TimeoutGovernor {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Effective deadline: request header (clamped), then per-provider
    /// override, then the configured default. Invalid header values are
    /// ignored with a warning rather than rejected.
    pub fn resolve(&self, header: Option<&str>, provider: Option<ProviderId>) -> u64 {
        if let Some(raw) = header {
            match raw.trim().parse::<i64>() {
                Ok(value) if value >= 1 => {
                    return (value as u64).min(self.config.max_allowed_ms);
                }
                _ => warn!(value = raw, "ignoring invalid X-Timeout-Ms header"),
            }
        }

        if let Some(provider) = provider {
            if let Some(override_ms) = self.config.per_provider.get(&provider) {
                return *override_ms;
            }
        }

        self.config.default_ms
    }

    pub fn arm(&self, timeout_ms: u64) -> RequestDeadline {
        let token = CancellationToken::new();
        let timer_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            timer_token.cancel();
        });
        RequestDeadline {
            timeout_ms,
            token,
            _timer: AbortOnDrop::new(handle.abort_handle()),
        }
    }
}

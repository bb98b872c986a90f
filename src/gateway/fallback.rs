use std::future::Future;
use std::time::Instant;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::retry::{backoff_delay, is_retryable};
use super::rules::RankedProvider;
use crate::types::{ProviderId, RetryAttempt};
use crate::utils::now_millis;
use crate::{GatewayError, Result};

#[derive(Clone, Copy, Debug)]
pub struct FallbackConfig {
    /// Retries per provider; total attempts per provider are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub provider: ProviderId,
    pub model: String,
    pub attempts: Vec<RetryAttempt>,
    pub providers_tried: usize,
}

/// Walks the ranked candidates in order, retrying retryable failures with
/// full-jitter backoff and failing over on everything else. Every attempt
/// lands in the log exactly once; at most one success terminates the chain.
/// A fired deadline aborts the whole chain immediately.
pub async fn run<T, F, Fut>(
    candidates: &[RankedProvider],
    config: FallbackConfig,
    cancel: &CancellationToken,
    timeout_ms: u64,
    mut exec: F,
) -> Result<FallbackOutcome<T>>
where
    F: FnMut(RankedProvider) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts: Vec<RetryAttempt> = Vec::new();
    let mut tried: Vec<ProviderId> = Vec::new();

    for candidate in candidates {
        if !tried.contains(&candidate.provider) {
            tried.push(candidate.provider);
        }

        for attempt in 0..=config.max_retries {
            if cancel.is_cancelled() {
                return Err(GatewayError::Timeout {
                    timeout_ms,
                    provider: Some(candidate.provider),
                });
            }

            let started_at_ms = now_millis();
            let started = Instant::now();
            let result = exec(candidate.clone()).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    attempts.push(RetryAttempt {
                        provider: candidate.provider,
                        error: None,
                        latency_ms,
                        started_at_ms,
                    });
                    return Ok(FallbackOutcome {
                        value,
                        provider: candidate.provider,
                        model: candidate.model.clone(),
                        attempts,
                        providers_tried: tried.len(),
                    });
                }
                Err(err) => {
                    attempts.push(RetryAttempt {
                        provider: candidate.provider,
                        error: Some(err.to_string()),
                        latency_ms,
                        started_at_ms,
                    });

                    if matches!(err, GatewayError::Timeout { .. }) {
                        return Err(err);
                    }

                    if is_retryable(&err) && attempt < config.max_retries {
                        let delay = backoff_delay(attempt, config.backoff_base_ms);
                        debug!(
                            provider = %candidate.provider,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying after backoff"
                        );
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return Err(GatewayError::Timeout {
                                    timeout_ms,
                                    provider: Some(candidate.provider),
                                });
                            }
                        }
                        continue;
                    }

                    debug!(
                        provider = %candidate.provider,
                        error = %err,
                        "giving up on provider"
                    );
                    break;
                }
            }
        }
    }

    Err(GatewayError::AllFailed { attempts })
}

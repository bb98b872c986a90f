use std::time::Duration;

use rand::Rng;

use crate::GatewayError;

const BACKOFF_CAP_MS: u64 = 10_000;

const TRANSIENT_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "socket hang up",
    "network",
    "fetch failed",
    "abort",
];

fn message_looks_transient(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

/// Whether the same provider is worth another attempt.
///
/// Upstream failures retry on 429 and 5xx; a missing status means the call
/// died at the network level, which is always retryable. Local rate-limit
/// denials retry after backoff. The request-level deadline firing is final:
/// retrying a timed-out request would only double the damage.
pub fn is_retryable(error: &GatewayError) -> bool {
    match error {
        GatewayError::Upstream {
            status: Some(status),
            ..
        } => *status == 429 || *status >= 500,
        GatewayError::Upstream { status: None, .. } => true,
        GatewayError::RateLimited { .. } => true,
        GatewayError::Internal(message) => message_looks_transient(message),
        GatewayError::Timeout { .. }
        | GatewayError::Validation(_)
        | GatewayError::NoProviders { .. }
        | GatewayError::AllFailed { .. } => false,
    }
}

/// Full-jitter backoff: uniform over `[0, min(cap, base·2^attempt))`.
/// Sampling the whole window keeps concurrent retries from aligning into
/// synchronized bursts.
pub fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let shift = attempt.min(32);
    let ceiling = base_ms
        .saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX))
        .min(BACKOFF_CAP_MS)
        .max(1);
    let jittered = rand::thread_rng().gen_range(0..ceiling);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderId;

    fn upstream(status: Option<u16>, message: &str) -> GatewayError {
        GatewayError::Upstream {
            provider: ProviderId::OpenAi,
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn status_classification_matches_the_taxonomy() {
        assert!(is_retryable(&upstream(Some(429), "slow down")));
        assert!(is_retryable(&upstream(Some(500), "boom")));
        assert!(is_retryable(&upstream(Some(503), "overloaded")));
        assert!(is_retryable(&upstream(None, "tcp reset")));
        for status in [400, 401, 403, 404, 422] {
            assert!(!is_retryable(&upstream(Some(status), "client error")));
        }
    }

    #[test]
    fn transient_message_phrases_are_retryable() {
        assert!(is_retryable(&GatewayError::Internal(
            "connection reset by peer".to_string()
        )));
        assert!(is_retryable(&GatewayError::Internal(
            "fetch failed".to_string()
        )));
        assert!(!is_retryable(&GatewayError::Internal(
            "schema mismatch".to_string()
        )));
    }

    #[test]
    fn deadline_and_validation_failures_are_final() {
        assert!(!is_retryable(&GatewayError::Timeout {
            timeout_ms: 50,
            provider: None,
        }));
        assert!(!is_retryable(&GatewayError::Validation("bad".to_string())));
    }

    #[test]
    fn backoff_stays_inside_the_jitter_window() {
        for attempt in 0..12 {
            let ceiling = 500u64
                .saturating_mul(1u64 << attempt)
                .min(BACKOFF_CAP_MS);
            for _ in 0..50 {
                let delay = backoff_delay(attempt, 500);
                assert!(delay.as_millis() < u128::from(ceiling.max(1)));
            }
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let delay = backoff_delay(u32::MAX, 500);
        assert!(delay.as_millis() < u128::from(BACKOFF_CAP_MS));
    }
}

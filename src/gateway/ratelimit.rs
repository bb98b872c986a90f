use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::warn;

use crate::types::ProviderId;
use crate::utils::now_millis;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Admission {
    Admitted,
    Denied { retry_after_ms: u64 },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// One token bucket per registered provider. Unknown providers are denied:
/// admission fails closed rather than waving unmetered traffic through.
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<ProviderId, Bucket>>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig, providers: &[ProviderId]) -> Self {
        let mut buckets = HashMap::new();
        for provider in providers {
            buckets.insert(
                *provider,
                Bucket {
                    tokens: f64::from(config.capacity),
                    last_refill_ms: 0,
                },
            );
        }
        Self {
            config,
            buckets: Mutex::new(buckets),
        }
    }

    pub fn try_acquire(&self, provider: ProviderId) -> Admission {
        self.try_acquire_at(provider, now_millis())
    }

    pub fn try_acquire_at(&self, provider: ProviderId, now_ms: u64) -> Admission {
        let mut buckets = self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(bucket) = buckets.get_mut(&provider) else {
            warn!(%provider, "rate limit check for unregistered provider; denying");
            return Admission::Denied {
                retry_after_ms: 1_000,
            };
        };

        refill(bucket, &self.config, now_ms);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Admission::Admitted;
        }

        let refill_per_sec = self.config.refill_per_sec.max(f64::MIN_POSITIVE);
        let retry_after_ms = ((1.0 - bucket.tokens) / refill_per_sec * 1000.0).ceil() as u64;
        Admission::Denied { retry_after_ms }
    }

    /// Whole tokens currently available, without consuming any.
    pub fn remaining(&self, provider: ProviderId) -> u32 {
        self.remaining_at(provider, now_millis())
    }

    pub fn remaining_at(&self, provider: ProviderId, now_ms: u64) -> u32 {
        let mut buckets = self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(bucket) = buckets.get_mut(&provider) else {
            return 0;
        };
        refill(bucket, &self.config, now_ms);
        bucket.tokens.floor().max(0.0) as u32
    }
}

fn refill(bucket: &mut Bucket, config: &RateLimitConfig, now_ms: u64) {
    let elapsed_ms = now_ms.saturating_sub(bucket.last_refill_ms);
    if elapsed_ms > 0 {
        let refilled = bucket.tokens + elapsed_ms as f64 / 1000.0 * config.refill_per_sec;
        bucket.tokens = refilled.min(f64::from(config.capacity));
        bucket.last_refill_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_per_sec: f64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(
            RateLimitConfig {
                capacity,
                refill_per_sec,
            },
            &[ProviderId::OpenAi],
        )
    }

    #[test]
    fn admits_until_the_bucket_is_drained() {
        let limiter = limiter(3, 1.0);
        let now = 1_000;
        for _ in 0..3 {
            assert_eq!(limiter.try_acquire_at(ProviderId::OpenAi, now), Admission::Admitted);
        }
        assert!(matches!(
            limiter.try_acquire_at(ProviderId::OpenAi, now),
            Admission::Denied { .. }
        ));
    }

    #[test]
    fn denial_reports_the_refill_wait() {
        let limiter = limiter(1, 2.0);
        let now = 1_000;
        assert_eq!(limiter.try_acquire_at(ProviderId::OpenAi, now), Admission::Admitted);
        match limiter.try_acquire_at(ProviderId::OpenAi, now) {
            Admission::Denied { retry_after_ms } => assert_eq!(retry_after_ms, 500),
            Admission::Admitted => panic!("bucket should be empty"),
        }
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let limiter = limiter(2, 10.0);
        assert_eq!(limiter.try_acquire_at(ProviderId::OpenAi, 0), Admission::Admitted);
        // A long idle period must not overfill the bucket.
        assert_eq!(limiter.remaining_at(ProviderId::OpenAi, 60_000), 2);
    }

    #[test]
    fn unknown_provider_fails_closed() {
        let limiter = limiter(10, 1.0);
        assert!(matches!(
            limiter.try_acquire_at(ProviderId::Google, 0),
            Admission::Denied { .. }
        ));
        assert_eq!(limiter.remaining_at(ProviderId::Google, 0), 0);
    }

    #[test]
    fn tokens_recover_over_time() {
        let limiter = limiter(1, 1.0);
        assert_eq!(limiter.try_acquire_at(ProviderId::OpenAi, 0), Admission::Admitted);
        assert!(matches!(
            limiter.try_acquire_at(ProviderId::OpenAi, 10),
            Admission::Denied { .. }
        ));
        assert_eq!(
            limiter.try_acquire_at(ProviderId::OpenAi, 1_010),
            Admission::Admitted
        );
    }
}

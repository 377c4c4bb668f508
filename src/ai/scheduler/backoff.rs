//! Retry delay policy: exponential backoff with full jitter.

use rand::Rng;
use std::time::Duration;

use crate::constants::retry;
use crate::types::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Added on top of a server retry-after hint
    pub retry_after_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: retry::MAX_RETRIES,
            base_backoff: Duration::from_millis(retry::BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(retry::MAX_BACKOFF_MS),
            retry_after_jitter: Duration::from_millis(retry::RETRY_AFTER_JITTER_MS),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the jitter window for a zero-based retry attempt:
    /// `min(max_backoff, base * 2^attempt)`
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Whether `error` allows another attempt after `retries_done` retries
    pub fn should_retry(&self, error: &ProviderError, retries_done: u32) -> bool {
        error.is_retryable() && retries_done < self.max_retries
    }

    /// Delay before retry `attempt`. A server hint is honored verbatim plus
    /// a small jitter; otherwise the delay is uniform in `[0, ceiling]`.
    pub fn delay<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        match retry_after {
            Some(hint) => hint + jitter(self.retry_after_jitter, rng),
            None => jitter(self.ceiling(attempt), rng),
        }
    }
}

fn jitter<R: Rng + ?Sized>(upper: Duration, rng: &mut R) -> Duration {
    let upper_ms = upper.as_millis().min(u64::MAX as u128) as u64;
    if upper_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..=upper_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCategory;
    use proptest::prelude::*;

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(0), Duration::from_millis(500));
        assert_eq!(policy.ceiling(1), Duration::from_millis(1000));
        assert_eq!(policy.ceiling(3), Duration::from_millis(4000));
        assert_eq!(policy.ceiling(10), Duration::from_millis(30_000));
        assert_eq!(policy.ceiling(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        let limited = ProviderError::new(ErrorCategory::RateLimited, "slow down");
        let denied = ProviderError::new(ErrorCategory::InvalidCredentials, "bad key");

        assert!(policy.should_retry(&limited, 0));
        assert!(policy.should_retry(&limited, 4));
        assert!(!policy.should_retry(&limited, 5));
        assert!(!policy.should_retry(&denied, 0));
    }

    #[test]
    fn test_zero_base_means_no_delay() {
        let policy = RetryPolicy {
            base_backoff: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay(3, None, &mut rand::rng()), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_within_ceiling(attempt in 0u32..64) {
            let policy = RetryPolicy::default();
            let delay = policy.delay(attempt, None, &mut rand::rng());
            prop_assert!(delay <= policy.ceiling(attempt));
            prop_assert!(delay <= policy.max_backoff);
        }

        #[test]
        fn prop_retry_after_honored(attempt in 0u32..10, hint_ms in 0u64..120_000) {
            let policy = RetryPolicy::default();
            let hint = Duration::from_millis(hint_ms);
            let delay = policy.delay(attempt, Some(hint), &mut rand::rng());
            prop_assert!(delay >= hint);
            prop_assert!(delay <= hint + policy.retry_after_jitter);
        }
    }
}

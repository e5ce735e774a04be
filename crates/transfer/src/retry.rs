//! Retry decisions with exponential backoff.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use crate::error::UnitError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again once the delay has elapsed.
    Retry(Duration),
    /// Stop; the failure is terminal.
    GiveUp,
}

/// Backoff parameters. `decide` is a pure function of its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Spread delays by ±25% (see [`jittered`](Self::jittered)).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Decides after attempt `attempt_number` (1-based) failed with `error`.
    ///
    /// Non-retryable errors give up immediately regardless of the count.
    pub fn decide(&self, attempt_number: u32, error: &UnitError) -> RetryDecision {
        if !error.is_retryable() || attempt_number > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempt_number))
    }

    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Applies ±25% jitter derived from `seed` (e.g. unit id and attempt),
    /// so concurrent retries of different units spread out while a given
    /// unit/attempt pair always waits the same time.
    pub fn jittered(&self, delay: Duration, seed: impl Hash) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        // [-1.0, 1.0)
        let offset = (hasher.finish() % 2_000_001) as f64 / 1_000_000.0 - 1.0;
        let secs = delay.as_secs_f64();
        Duration::from_secs_f64((secs + secs * 0.25 * offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moldata_storage::StorageError;

    fn transient() -> UnitError {
        UnitError::Storage(StorageError::Transient {
            locator: "k".into(),
            detail: "connection reset".into(),
        })
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(60));
        assert!(p.jitter);
    }

    #[test]
    fn exponential_backoff_capped() {
        let p = policy(10);
        let expected_ms = [100, 200, 400, 800, 1000, 1000];
        for (i, &ms) in expected_ms.iter().enumerate() {
            assert_eq!(
                p.delay_for_attempt((i + 1) as u32),
                Duration::from_millis(ms),
                "attempt {}",
                i + 1
            );
        }
    }

    #[test]
    fn retries_until_attempt_exceeds_max() {
        let p = policy(3);
        let err = transient();
        assert!(matches!(p.decide(1, &err), RetryDecision::Retry(_)));
        assert!(matches!(p.decide(2, &err), RetryDecision::Retry(_)));
        assert!(matches!(p.decide(3, &err), RetryDecision::Retry(_)));
        assert_eq!(p.decide(4, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn auth_error_gives_up_immediately() {
        let p = policy(100);
        let err = UnitError::Storage(StorageError::Auth("bucket".into()));
        assert_eq!(p.decide(1, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn invalid_locator_gives_up_immediately() {
        let p = policy(100);
        let err = UnitError::Storage(StorageError::InvalidLocator("../x".into()));
        assert_eq!(p.decide(1, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn timeout_is_retried() {
        let p = policy(2);
        let err = UnitError::Timeout(Duration::from_secs(30));
        assert_eq!(
            p.decide(1, &err),
            RetryDecision::Retry(Duration::from_millis(100))
        );
    }

    #[test]
    fn zero_retries_gives_up_on_first_failure() {
        let p = policy(0);
        assert_eq!(p.decide(1, &transient()), RetryDecision::GiveUp);
    }

    #[test]
    fn jitter_within_bounds_and_deterministic() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        let base = Duration::from_secs(4);
        for attempt in 1..50u32 {
            let d = p.jittered(base, ("unit_7", attempt));
            let secs = d.as_secs_f64();
            assert!((3.0..=5.0).contains(&secs), "attempt {attempt}: {secs}");
            assert_eq!(d, p.jittered(base, ("unit_7", attempt)));
        }
    }

    #[test]
    fn jitter_disabled_is_identity() {
        let p = policy(3);
        let base = Duration::from_millis(750);
        assert_eq!(p.jittered(base, "x"), base);
    }
}

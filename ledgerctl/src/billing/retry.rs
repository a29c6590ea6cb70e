//! Bounded retry for optimistic-concurrency conflicts.

use std::time::Duration;

use rand::prelude::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize};

/// How many times a conflicting balance write is retried, and how long to wait in between.
///
/// Backoff is exponential with full jitter: attempt `n` sleeps a uniformly random duration in
/// `[0, min(max_delay, base_delay * 2^(n-1))]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep after the `attempt`-th failure (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    /// Jittered sleep after the `attempt`-th failure
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_micros() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rng().random_range(0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(1), Duration::from_millis(5));
        assert_eq!(policy.ceiling(2), Duration::from_millis(10));
        assert_eq!(policy.ceiling(3), Duration::from_millis(20));
        assert_eq!(policy.ceiling(10), Duration::from_millis(200));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_stays_within_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            assert!(policy.backoff(attempt) <= policy.ceiling(attempt));
        }
    }

    #[test]
    fn test_zero_delay_policy_never_sleeps() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(policy.backoff(3), Duration::ZERO);
    }
}

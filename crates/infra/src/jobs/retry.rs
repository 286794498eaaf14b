//! Retry decisions: exponential backoff with jitter, bounded attempt budget.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_max_delay() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Per-kind retry policy. Pure decision logic; timers live in the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total downstream calls a job may make (1 = no retries)
    pub max_attempts: u32,
    /// Base delay; also the upper bound of the jitter
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: default_max_delay(),
        }
    }

    /// Backoff without jitter: `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before re-queueing after `attempt` failed (1-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::rng())
    }

    /// Same as [`next_delay`](Self::next_delay) with a caller-supplied RNG.
    pub fn next_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..base_ms))
        };
        self.backoff(attempt) + jitter
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide what happens after attempt number `attempt` failed.
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if retryable && self.should_retry(attempt) {
            RetryDecision::Retry {
                delay: self.next_delay(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut policy = RetryPolicy::new(10, Duration::from_secs(30));
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));

        policy.max_delay = Duration::from_secs(100);
        assert_eq!(policy.backoff(3), Duration::from_secs(100));
        assert_eq!(policy.backoff(64), Duration::from_secs(100));
    }

    #[test]
    fn jitter_is_bounded_by_base() {
        let policy = RetryPolicy::new(5, Duration::from_millis(200));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=4 {
            for _ in 0..100 {
                let delay = policy.next_delay_with(attempt, &mut rng);
                let floor = policy.backoff(attempt);
                assert!(delay >= floor);
                assert!(delay < floor + policy.base_delay);
            }
        }
    }

    #[test]
    fn delays_grow_between_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        // Jitter is < base, so attempt n+1's minimum is >= attempt n's maximum.
        for attempt in 1..4 {
            let max_n = policy.backoff(attempt) + policy.base_delay;
            assert!(policy.backoff(attempt + 1) >= max_n);
        }
    }

    #[test]
    fn attempt_budget_is_respected() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        assert!(matches!(policy.decide(2, true), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(3, true), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1, false), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_base_means_no_jitter() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        assert_eq!(policy.next_delay(1), Duration::ZERO);
    }
}

//! Retry policy engine.
//!
//! Pure functions only: the step invoker asks [`RetryPolicy::next_delay`] how
//! long to back off after a failed attempt, and whether to give up.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy.
///
/// `maximum_attempts == 0` means unlimited attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
}

/// Outcome of [`RetryPolicy::next_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Delay(Duration),
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 0,
        }
    }
}

impl RetryPolicy {
    /// Default backoff with a bounded number of attempts.
    pub fn new(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    /// Uncapped-by-attempts delay after failed attempt `attempt` (1-based):
    /// `min(initial * coefficient^(attempt-1), maximum)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let coefficient = if self.backoff_coefficient.is_finite() && self.backoff_coefficient >= 1.0 {
            self.backoff_coefficient
        } else {
            1.0
        };
        let secs = self.initial_interval.as_secs_f64() * coefficient.powi(exp);
        let max = self.maximum_interval.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.maximum_interval;
        }
        Duration::from_secs_f64(secs)
    }

    /// Backoff after failed attempt `attempt` (1-based), or `GiveUp` once
    /// `attempt` exceeds the attempt budget.
    pub fn next_delay(&self, attempt: u32) -> RetryDecision {
        if self.maximum_attempts > 0 && attempt > self.maximum_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Delay(self.delay_for_attempt(attempt))
    }

    /// True when no attempt may follow attempt number `attempt`.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.maximum_attempts > 0 && attempt >= self.maximum_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: max,
        }
    }

    #[test]
    fn exponential_sequence_then_give_up() {
        let p = policy(5);
        let delays: Vec<_> = (1..=5).map(|a| p.next_delay(a)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16]
                .iter()
                .map(|s| RetryDecision::Delay(Duration::from_secs(*s)))
                .collect::<Vec<_>>()
        );
        assert_eq!(p.next_delay(6), RetryDecision::GiveUp);
    }

    #[test]
    fn delay_is_capped_at_maximum_interval() {
        let p = policy(0).with_maximum_interval(Duration::from_secs(10));
        assert_eq!(p.next_delay(4), RetryDecision::Delay(Duration::from_secs(8)));
        assert_eq!(p.next_delay(5), RetryDecision::Delay(Duration::from_secs(10)));
        assert_eq!(p.next_delay(1_000), RetryDecision::Delay(Duration::from_secs(10)));
    }

    #[test]
    fn zero_maximum_attempts_is_unlimited() {
        let p = policy(0);
        assert!(!p.is_exhausted(u32::MAX));
        assert!(matches!(p.next_delay(u32::MAX), RetryDecision::Delay(_)));
    }

    #[test]
    fn exhaustion_bounds_total_attempts() {
        let p = policy(3);
        assert!(!p.is_exhausted(2));
        assert!(p.is_exhausted(3));
        assert!(RetryPolicy::no_retry().is_exhausted(1));
    }

    proptest! {
        #[test]
        fn delays_never_shrink_and_never_exceed_cap(
            initial_ms in 1u64..5_000,
            coefficient in 1.0f64..4.0,
            cap_ms in 1u64..600_000,
            attempt in 1u32..64,
        ) {
            let p = RetryPolicy {
                initial_interval: Duration::from_millis(initial_ms),
                backoff_coefficient: coefficient,
                maximum_interval: Duration::from_millis(cap_ms),
                maximum_attempts: 0,
            };
            let a = p.delay_for_attempt(attempt);
            let b = p.delay_for_attempt(attempt + 1);
            prop_assert!(a <= b);
            prop_assert!(b <= p.maximum_interval);
        }
    }
}

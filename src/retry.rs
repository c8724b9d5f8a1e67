use crate::config::{Backoff, MaxAttempts};
use std::time::Duration;

/// Attempt bound for broker operations (publish, commit, subscribe). Transport
/// retries share the listener's backoff but always have a finite budget, even
/// when handler retries are configured as `Unlimited`.
pub(crate) const MAX_TRANSPORT_ATTEMPTS: u32 = 5;

/// Computed fresh per failure, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Exhausted,
}

/// Pure function of attempt count and configuration. Holds no cross-message
/// state, so it can be evaluated concurrently from every shard worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: MaxAttempts,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: MaxAttempts, backoff: Backoff) -> Self {
        Self { max_attempts, backoff }
    }

    /// `attempts_made` is the number of completed (failed) invocations for this
    /// occurrence, counting from 1.
    pub fn decide(&self, attempts_made: u32) -> RetryDecision {
        match self.max_attempts {
            MaxAttempts::Finite(max) if attempts_made >= max => RetryDecision::Exhausted,
            _ => RetryDecision::Retry(self.delay(attempts_made)),
        }
    }

    fn delay(&self, attempts_made: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { base } => base,
            Backoff::Exponential { base, cap } => {
                let shift = attempts_made.saturating_sub(1).min(16);
                base.saturating_mul(1 << shift).min(cap)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(millis: u64) -> Backoff {
        Backoff::Fixed { base: Duration::from_millis(millis) }
    }

    #[test]
    fn fixed_backoff_keeps_a_constant_delay() {
        let policy = RetryPolicy::new(MaxAttempts::Finite(10), fixed(250));
        for attempt in 1..9 {
            assert_eq!(
                policy.decide(attempt),
                RetryDecision::Retry(Duration::from_millis(250))
            );
        }
    }

    #[test]
    fn exponential_backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(
            MaxAttempts::Finite(10),
            Backoff::Exponential {
                base: Duration::from_millis(500),
                cap: Duration::from_millis(2_000),
            },
        );
        let delays: Vec<_> = (1..6)
            .map(|attempt| match policy.decide(attempt) {
                RetryDecision::Retry(delay) => delay.as_millis(),
                RetryDecision::Exhausted => panic!("not exhausted at attempt {attempt}"),
            })
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 2_000, 2_000]);
    }

    #[test]
    fn single_attempt_budget_exhausts_on_first_failure() {
        let policy = RetryPolicy::new(MaxAttempts::Finite(1), fixed(100));
        assert_eq!(policy.decide(1), RetryDecision::Exhausted);
    }

    #[test]
    fn exhausts_exactly_at_the_budget() {
        let policy = RetryPolicy::new(MaxAttempts::Finite(3), fixed(100));
        assert!(matches!(policy.decide(1), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(2), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(3), RetryDecision::Exhausted);
    }

    #[test]
    fn unlimited_budget_never_exhausts() {
        let policy = RetryPolicy::new(MaxAttempts::Unlimited, fixed(100));
        assert!(matches!(policy.decide(1_000_000), RetryDecision::Retry(_)));
    }

    #[test]
    fn large_attempt_counts_do_not_overflow_the_delay() {
        let policy = RetryPolicy::new(
            MaxAttempts::Unlimited,
            Backoff::Exponential {
                base: Duration::from_millis(500),
                cap: Duration::from_secs(30),
            },
        );
        assert_eq!(
            policy.decide(u32::MAX),
            RetryDecision::Retry(Duration::from_secs(30))
        );
    }
}

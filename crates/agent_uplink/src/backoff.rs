use crate::config::RetryPolicy;
use std::time::Duration;

/// Retry bookkeeping for one handshake step.
///
/// Counts down on every failure and snaps back to `max_attempts` on every
/// success. Reaching zero is reported through [`is_exhausted`](Self::is_exhausted)
/// but does not stop retries: the delay just stays at the policy ceiling.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    attempts_remaining: u32,
    consecutive_failures: u32,
    policy: RetryPolicy,
}

impl RetryCounter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts_remaining: policy.max_attempts,
            consecutive_failures: 0,
            policy,
        }
    }

    /// Records a failed attempt and returns how long to wait before the next.
    pub fn record_failure(&mut self) -> Duration {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.policy.delay_for_attempt(self.consecutive_failures)
    }

    /// Records a successful attempt.
    pub fn record_success(&mut self) {
        self.reset();
    }

    #[inline]
    pub fn reset(&mut self) {
        self.attempts_remaining = self.policy.max_attempts;
        self.consecutive_failures = 0;
    }

    #[inline]
    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    #[inline]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.attempts_remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_three_failures_then_success() {
        let mut counter = RetryCounter::new(policy());
        assert_eq!(counter.attempts_remaining(), 5);

        for expected in [4, 3, 2] {
            counter.record_failure();
            assert_eq!(counter.attempts_remaining(), expected);
        }

        counter.record_success();
        assert_eq!(counter.attempts_remaining(), counter.max_attempts());
        assert_eq!(counter.consecutive_failures(), 0);
    }

    #[test]
    fn test_backoff_saturates_after_exhaustion() {
        let mut counter = RetryCounter::new(policy());

        let delays: Vec<Duration> = (0..8).map(|_| counter.record_failure()).collect();

        assert!(counter.is_exhausted());
        assert_eq!(counter.attempts_remaining(), 0);
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
        assert!(delays[2..].iter().all(|d| *d == Duration::from_millis(40)));
    }

    #[test]
    fn test_success_restarts_the_schedule() {
        let mut counter = RetryCounter::new(policy());
        counter.record_failure();
        counter.record_failure();
        counter.record_success();

        assert_eq!(counter.record_failure(), Duration::from_millis(10));
    }
}

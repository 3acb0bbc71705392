//! Bounded retry schedule.
//!
//! ```text
//! attempt 1 ──fail──▶ wait 1s ──▶ attempt 2 ──fail──▶ wait 2s ──▶ attempt 3
//!     ──fail──▶ wait 4s ──▶ attempt 4 ──fail──▶ exhausted (error surfaces)
//! ```
//!
//! The state is a plain attempt counter, so the number of attempts and the
//! worst-case time spent backing off are known up front.

use std::time::Duration;

/// Exponential backoff with a fixed number of retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { base, max_retries, retries: 0 }
    }

    /// Delay to wait before the next attempt, or `None` once every retry has
    /// been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        let delay = self.base.saturating_mul(1 << self.retries.min(16));
        self.retries += 1;
        Some(delay)
    }

    /// Retries consumed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Sum of every delay this schedule can produce.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|retry| self.base.saturating_mul(1 << retry.min(16)))
            .try_fold(Duration::ZERO, |total, delay| total.checked_add(delay))
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_schedule() {
        let mut backoff = Backoff::new(3, Duration::from_secs(1));
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays, [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.retries(), 3);
        assert_eq!(backoff.next_delay(), None);
    }

    #[rstest]
    #[case::no_retries(0, Duration::ZERO)]
    #[case::one(1, Duration::from_millis(100))]
    #[case::three(3, Duration::from_millis(700))]
    fn test_total_delay(#[case] retries: u32, #[case] expected: Duration) {
        assert_eq!(Backoff::new(retries, Duration::from_millis(100)).total_delay(), expected);
    }

    #[test]
    fn test_total_delay_saturates() {
        assert_eq!(Backoff::new(3, Duration::MAX).total_delay(), Duration::MAX);
    }
}

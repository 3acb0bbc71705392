use std::time::Duration;
use tokio::time::Instant;

/// Minimum-interval gate for periodic notifications.
///
/// Uses Tokio's clock so that tests running with a paused runtime can drive
/// it deterministically.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` at most once per interval. The first call always passes.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    pub fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            },
        }
    }

    /// Forget the last emission so the next call passes unconditionally.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_first_call_always_passes() {
        let mut throttle = Throttle::new(Duration::from_secs(60));
        assert!(throttle.ready_at(Instant::now()));
    }

    #[rstest]
    #[case::too_soon(Duration::from_millis(199), false)]
    #[case::exactly_on_interval(Duration::from_millis(200), true)]
    #[case::well_after(Duration::from_secs(3), true)]
    fn test_interval_gate(#[case] elapsed: Duration, #[case] expected: bool) {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(200));
        assert!(throttle.ready_at(start));
        assert_eq!(throttle.ready_at(start + elapsed), expected);
    }

    #[test]
    fn test_reset_reopens_gate() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(1));
        assert!(throttle.ready_at(start));
        assert!(!throttle.ready_at(start));
        throttle.reset();
        assert!(throttle.ready_at(start));
    }
}

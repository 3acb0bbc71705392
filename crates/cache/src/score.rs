use std::time::Duration;

/// Hybrid recency/frequency score used to pick eviction victims; lowest goes
/// first.
///
/// ```text
/// score = recency_weight * 2^(-idle / half_life) + frequency_weight * ln(1 + hits)
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scorer {
    pub recency_weight: f64,
    pub frequency_weight: f64,
    /// Idle time after which the recency term has halved.
    pub half_life: Duration,
}

impl Default for Scorer {
    fn default() -> Self {
        Self { recency_weight: 0.6, frequency_weight: 0.4, half_life: Duration::from_secs(60 * 60) }
    }
}

impl Scorer {
    /// Score an entry last accessed at `last_access_ms` with `hits` reads, as
    /// of `now_ms` (both Unix milliseconds).
    pub fn score(&self, now_ms: i64, last_access_ms: i64, hits: u64) -> f64 {
        let idle = now_ms.saturating_sub(last_access_ms).max(0) as f64;
        let half_life = (self.half_life.as_millis() as f64).max(1.0);
        let recency = (-idle / half_life).exp2();
        let frequency = (1.0 + hits as f64).ln();
        self.recency_weight * recency + self.frequency_weight * frequency
    }
}

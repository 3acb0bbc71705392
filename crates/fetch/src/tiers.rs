//! The single timeout schedule used by every layer.
//!
//! | tier      | default | bounds                                             |
//! |-----------|---------|----------------------------------------------------|
//! | fast      | 45s     | chunked loading on a fast connection               |
//! | normal    | 120s    | chunked loading on a slow or very slow connection  |
//! | emergency | 180s    | the whole load, full-file fallback included         |
//!
//! Individual requests get an equal share of the active tier per attempt so
//! that a request and all of its retries fit inside the tier.

use crate::speed::SpeedClass;
use std::time::Duration;

const MIN_ATTEMPT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTiers {
    pub fast: Duration,
    pub normal: Duration,
    pub emergency: Duration,
}

impl Default for TimeoutTiers {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(45),
            normal: Duration::from_secs(120),
            emergency: Duration::from_secs(180),
        }
    }
}

impl TimeoutTiers {
    /// Budget for chunked loading at the given connection speed.
    pub fn chunked_budget(&self, speed: SpeedClass) -> Duration {
        match speed {
            SpeedClass::Fast => self.fast,
            SpeedClass::Slow | SpeedClass::VerySlow => self.normal,
        }
    }

    /// Time allowed for one attempt of a request governed by `tier`.
    ///
    /// Never below one second, unless the tier itself is shorter than that.
    pub fn per_attempt(tier: Duration, max_retries: u32) -> Duration {
        let share = tier / max_retries.saturating_add(1);
        share.max(MIN_ATTEMPT.min(tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::fast(SpeedClass::Fast, Duration::from_secs(45))]
    #[case::slow(SpeedClass::Slow, Duration::from_secs(120))]
    #[case::very_slow(SpeedClass::VerySlow, Duration::from_secs(120))]
    fn test_chunked_budget(#[case] speed: SpeedClass, #[case] expected: Duration) {
        assert_eq!(TimeoutTiers::default().chunked_budget(speed), expected);
    }

    #[rstest]
    #[case::even_split(Duration::from_secs(120), 3, Duration::from_secs(30))]
    #[case::floor(Duration::from_secs(2), 3, Duration::from_secs(1))]
    #[case::tier_below_floor(Duration::from_millis(300), 3, Duration::from_millis(300))]
    #[case::no_retries(Duration::from_secs(45), 0, Duration::from_secs(45))]
    #[case::saturates(Duration::from_secs(45), u32::MAX, Duration::from_secs(1))]
    fn test_per_attempt(#[case] tier: Duration, #[case] retries: u32, #[case] expected: Duration) {
        assert_eq!(TimeoutTiers::per_attempt(tier, retries), expected);
    }
}

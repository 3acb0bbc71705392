use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection speed measured once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeedClass {
    Fast,
    Slow,
    VerySlow,
}

impl SpeedClass {
    /// Message suitable for showing to whoever is waiting on the load.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Fast => "Connection is fast; loading data on demand.",
            Self::Slow => "Connection is slow; the first queries may take a few seconds.",
            Self::VerySlow => "Connection is very slow; loading may take several minutes.",
        }
    }
}

impl fmt::Display for SpeedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
            Self::VerySlow => "very slow",
        })
    }
}

/// Throughput boundaries, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedThresholds {
    pub fast: f64,
    pub slow: f64,
}

impl Default for SpeedThresholds {
    fn default() -> Self {
        Self { fast: 1024.0 * 1024.0, slow: 128.0 * 1024.0 }
    }
}

impl SpeedThresholds {
    pub fn classify(&self, bytes: u64, elapsed: Duration) -> SpeedClass {
        let rate = bytes as f64 / elapsed.as_secs_f64().max(0.001);
        if rate >= self.fast {
            SpeedClass::Fast
        } else if rate >= self.slow {
            SpeedClass::Slow
        } else {
            SpeedClass::VerySlow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::instant(16_384, Duration::ZERO, SpeedClass::Fast)]
    #[case::two_mib_per_sec(2 * 1024 * 1024, Duration::from_secs(1), SpeedClass::Fast)]
    #[case::exactly_fast(1024 * 1024, Duration::from_secs(1), SpeedClass::Fast)]
    #[case::half_mib_per_sec(16_384, Duration::from_millis(32), SpeedClass::Slow)]
    #[case::crawling(16_384, Duration::from_secs(2), SpeedClass::VerySlow)]
    fn test_classify(#[case] bytes: u64, #[case] elapsed: Duration, #[case] expected: SpeedClass) {
        assert_eq!(SpeedThresholds::default().classify(bytes, elapsed), expected);
    }
}

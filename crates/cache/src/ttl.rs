use crate::error::{Error, ErrorKind};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How long a cached result may be served, counted from when it was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    /// Lookups over reference data that only changes with a new file version.
    #[display("static")]
    Static,
    /// Aggregates and other derived views.
    #[display("derived")]
    Derived,
    /// Interactive, one-off queries such as search-as-you-type.
    #[display("ephemeral")]
    Ephemeral,
}

impl FromStr for TtlClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "derived" => Ok(Self::Derived),
            "ephemeral" => Ok(Self::Ephemeral),
            _ => exn::bail!(ErrorKind::InvalidData("unknown TTL class")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    pub static_ttl: Duration,
    pub derived_ttl: Duration,
    pub ephemeral_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            static_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            derived_ttl: Duration::from_secs(6 * 60 * 60),
            ephemeral_ttl: Duration::from_secs(10 * 60),
        }
    }
}

impl TtlPolicy {
    pub fn ttl(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Static => self.static_ttl,
            TtlClass::Derived => self.derived_ttl,
            TtlClass::Ephemeral => self.ephemeral_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TtlClass::Static, 604_800)]
    #[case(TtlClass::Derived, 21_600)]
    #[case(TtlClass::Ephemeral, 600)]
    fn test_default_ttls(#[case] class: TtlClass, #[case] secs: u64) {
        assert_eq!(TtlPolicy::default().ttl(class), Duration::from_secs(secs));
        assert_eq!(class.to_string().parse::<TtlClass>().unwrap(), class);
    }

    #[test]
    fn test_unknown_class() {
        let err = "forever".parse::<TtlClass>().unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidData(_)));
    }
}

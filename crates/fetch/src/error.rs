//! Fetch Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error tree
//! construction. The kinds are `Clone` so that one failed fetch can be handed
//! to every caller that was coalesced onto it.

use derive_more::{Display, Error};
use std::time::Duration;

/// A fetch error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for fetch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Clone, Display, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure or a server-side (5xx/429) response.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// A single attempt did not complete within its time budget.
    #[display("request timed out after {}ms", _0.as_millis())]
    Timeout(#[error(not(source))] Duration),
    /// The bytes received do not belong to the file version this session is
    /// reading (short body, changed ETag, hash mismatch, ...).
    #[display("integrity error: {_0}")]
    Integrity(#[error(not(source))] String),
    /// The source answered a range request with the whole resource.
    #[display("source does not support range requests")]
    RangeUnsupported,
    #[display("source not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Any other client-side HTTP status.
    #[display("unexpected HTTP status {_0}")]
    Status(#[error(not(source))] u16),
    #[display("invalid request: {_0}")]
    InvalidRequest(#[error(not(source))] String),
    #[display("request cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::network(ErrorKind::Network("reset".into()), true)]
    #[case::timeout(ErrorKind::Timeout(Duration::from_secs(1)), true)]
    #[case::integrity(ErrorKind::Integrity("etag".into()), false)]
    #[case::range(ErrorKind::RangeUnsupported, false)]
    #[case::not_found(ErrorKind::NotFound("db".into()), false)]
    #[case::status(ErrorKind::Status(403), false)]
    #[case::cancelled(ErrorKind::Cancelled, false)]
    fn test_retryable_kinds(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }
}

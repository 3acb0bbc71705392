//! Database Handle Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error tree
//! construction. Failures from the lower layers are raised into one of these
//! kinds, keeping the original error in the tree.

use derive_more::{Display, Error};
use rangedb_cache::error::ErrorKind as CacheErrorKind;
use rangedb_engine::error::ErrorKind as EngineErrorKind;
use rangedb_fetch::error::ErrorKind as FetchErrorKind;
use rangedb_pages::error::ErrorKind as PageErrorKind;
use std::time::Duration;

/// A database handle error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for database handle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Clone, Display, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration is invalid or incomplete.
    #[display("invalid configuration")]
    Config,
    /// Loading failed for good; the message is meant for end users. Call
    /// [`retry`](crate::DatabaseHandle::retry) to try again.
    #[display("database unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The statement itself is at fault. Retrying will not help.
    #[display("query error: {_0}")]
    Query(#[error(not(source))] String),
    #[display("query cancelled")]
    Cancelled,
    /// The query did not finish before its deadline.
    #[display("query timed out after {}ms", _0.as_millis())]
    Timeout(#[error(not(source))] Duration),
    /// Pages needed by the query could not be fetched.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// The remote file no longer matches this session. Call
    /// [`reset`](crate::DatabaseHandle::reset).
    #[display("database file changed during the session")]
    Integrity,
    #[display("database handle is closed")]
    Closed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) | Self::Network(_) => true,
            Self::Config | Self::Query(_) | Self::Cancelled | Self::Integrity | Self::Closed => false,
        }
    }

    pub(crate) fn from_engine(kind: &EngineErrorKind) -> Self {
        match kind {
            EngineErrorKind::Query(message) | EngineErrorKind::Vfs(message) => Self::Query(message.clone()),
            EngineErrorKind::Page(page) => Self::from_page(page),
            EngineErrorKind::Cancelled => Self::Cancelled,
            EngineErrorKind::Timeout(after) => Self::Timeout(*after),
            EngineErrorKind::Shutdown => Self::Closed,
        }
    }

    fn from_page(kind: &PageErrorKind) -> Self {
        match kind {
            PageErrorKind::Fetch(FetchErrorKind::Integrity(_)) => Self::Integrity,
            PageErrorKind::Fetch(FetchErrorKind::Cancelled) | PageErrorKind::Cancelled => Self::Cancelled,
            PageErrorKind::Fetch(fetch) => Self::Network(fetch.to_string()),
            PageErrorKind::OutOfBounds(_) => Self::Query(kind.to_string()),
            PageErrorKind::Abandoned => Self::Network(kind.to_string()),
        }
    }

    pub(crate) fn from_cache(kind: &CacheErrorKind) -> Self {
        match kind {
            CacheErrorKind::Compute(engine) => Self::from_engine(engine),
            CacheErrorKind::Abandoned => Self::Cancelled,
            other => Self::Query(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::query(EngineErrorKind::Query("no such table: nope".into()), ErrorKind::Query("no such table: nope".into()))]
    #[case::cancelled(EngineErrorKind::Cancelled, ErrorKind::Cancelled)]
    #[case::deadline(EngineErrorKind::Timeout(Duration::from_secs(3)), ErrorKind::Timeout(Duration::from_secs(3)))]
    #[case::shutdown(EngineErrorKind::Shutdown, ErrorKind::Closed)]
    #[case::integrity(
        EngineErrorKind::Page(PageErrorKind::Fetch(FetchErrorKind::Integrity("etag".into()))),
        ErrorKind::Integrity
    )]
    #[case::network(
        EngineErrorKind::Page(PageErrorKind::Fetch(FetchErrorKind::Network("reset".into()))),
        ErrorKind::Network("network error: reset".into())
    )]
    #[case::lease(EngineErrorKind::Page(PageErrorKind::Cancelled), ErrorKind::Cancelled)]
    fn test_engine_kinds(#[case] engine: EngineErrorKind, #[case] expected: ErrorKind) {
        assert_eq!(ErrorKind::from_engine(&engine), expected);
        assert_eq!(ErrorKind::from_cache(&CacheErrorKind::Compute(engine)), expected);
    }

    #[rstest]
    #[case(ErrorKind::Unavailable("slow".into()), true)]
    #[case(ErrorKind::Network("reset".into()), true)]
    #[case(ErrorKind::Integrity, false)]
    #[case(ErrorKind::Query("syntax".into()), false)]
    fn test_is_retryable(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }
}

//! Page Cache Error Types

use derive_more::{Display, Error};
use rangedb_fetch::error::ErrorKind as FetchErrorKind;

/// A page cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for page cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// `Clone` because a failed page fetch is reported to every reader that was
/// waiting on it.
#[derive(Debug, Clone, Display, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// The underlying range fetch failed.
    #[display("page fetch failed: {_0}")]
    Fetch(FetchErrorKind),
    #[display("page {_0} is beyond the end of the file")]
    OutOfBounds(#[error(not(source))] u64),
    /// The reader's lease was cancelled before the page was requested.
    #[display("read cancelled")]
    Cancelled,
    /// The task fetching the page died before finishing.
    #[display("page fetch abandoned")]
    Abandoned,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(kind) => kind.is_retryable(),
            Self::Abandoned => true,
            Self::OutOfBounds(_) | Self::Cancelled => false,
        }
    }

    /// The fetch failure behind this error, if any.
    pub fn fetch_kind(&self) -> Option<&FetchErrorKind> {
        match self {
            Self::Fetch(kind) => Some(kind),
            _ => None,
        }
    }
}

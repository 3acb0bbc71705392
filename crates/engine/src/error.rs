//! Query Engine Error Types

use derive_more::{Display, Error};
use rangedb_fetch::error::ErrorKind as FetchErrorKind;
use rangedb_pages::error::ErrorKind as PageErrorKind;
use std::time::Duration;

/// A query engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for query engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// `Clone` so that one failed computation can be reported to every caller
/// coalesced onto it.
#[derive(Debug, Clone, Display, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// SQLite rejected the statement (syntax, missing table, not read-only, ...).
    #[display("query error: {_0}")]
    Query(#[error(not(source))] String),
    /// A database page could not be read.
    #[display("page read failed: {_0}")]
    Page(PageErrorKind),
    #[display("query cancelled")]
    Cancelled,
    /// The query did not finish before its deadline.
    #[display("query timed out after {}ms", _0.as_millis())]
    Timeout(#[error(not(source))] Duration),
    /// The engine was shut down or its workers went away.
    #[display("query engine is shut down")]
    Shutdown,
    /// The virtual file system could not be set up.
    #[display("VFS error: {_0}")]
    Vfs(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Page(kind) => kind.is_retryable(),
            Self::Timeout(_) => true,
            Self::Query(_) | Self::Cancelled | Self::Shutdown | Self::Vfs(_) => false,
        }
    }

    /// The range fetch failure at the bottom of this error, if any.
    pub fn fetch_kind(&self) -> Option<&FetchErrorKind> {
        match self {
            Self::Page(kind) => kind.fetch_kind(),
            _ => None,
        }
    }
}

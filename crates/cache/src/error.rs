//! Result Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use rangedb_engine::error::ErrorKind as EngineErrorKind;

/// A result cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for result cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Serialization/deserialization error.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// Computing the value to cache failed.
    #[display("computing result failed: {_0}")]
    Compute(EngineErrorKind),
    /// The shared computation went away before finishing.
    #[display("shared computation was abandoned")]
    Abandoned,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Compute(kind) => kind.is_retryable(),
            Self::Abandoned => true,
            Self::Database | Self::Migration | Self::InvalidData(_) => false,
        }
    }
}

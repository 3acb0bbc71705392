//! Range source trait and implementations.
//!
//! A [`RangeSource`] is anything that can hand out arbitrary byte ranges of a
//! single immutable file: an HTTP server honouring `Range` headers, a file on
//! local disk, or an in-memory double for tests. Retry, timeouts and
//! concurrency limits live in [`RangeFetcher`](crate::RangeFetcher); sources
//! only perform single attempts.

mod http;
mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::http::HttpSource;
pub use self::local::LocalSource;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockSource;
use crate::error::Result;
use crate::models::{FileVersion, SourceInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Shared, dynamically dispatched source.
pub type SourceHandle = Arc<dyn RangeSource>;

/// Unified interface for partial-content byte sources.
///
/// # Examples
///
/// ```
/// use rangedb_fetch::{RangeSource, error::Result};
///
/// async fn read_header(source: &dyn RangeSource) -> Result<Vec<u8>> {
///     let info = source.probe().await?;
///     let header = source.read_range(0, 100.min(info.size), &info.version).await?;
///     Ok(header.to_vec())
/// }
/// ```
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Name of the source, for logging only.
    fn name(&self) -> &str;

    /// Discover size, version and range support without downloading the file.
    async fn probe(&self) -> Result<SourceInfo>;

    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// Fails with [`Integrity`](crate::error::ErrorKind::Integrity) if the
    /// source can tell that it no longer serves `version`, and with
    /// [`RangeUnsupported`](crate::error::ErrorKind::RangeUnsupported) if it
    /// cannot serve partial content at all.
    async fn read_range(&self, offset: u64, length: u64, version: &FileVersion) -> Result<Bytes>;

    /// Download the complete file.
    async fn read_all(&self, version: &FileVersion) -> Result<Bytes>;
}

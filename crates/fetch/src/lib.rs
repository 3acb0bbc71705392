//! Partial-content fetching for remote, read-only files.
//!
//! # Architecture
//! - **Sources** ([`RangeSource`]): single-attempt byte range reads from HTTP,
//!   local disk, or (with the `mock` feature) memory.
//! - **[`RangeFetcher`]**: wraps a source with the retry state machine
//!   ([`Backoff`]), per-attempt timeouts derived from [`TimeoutTiers`], a
//!   global concurrency limit, the one-off connection speed probe and
//!   integrity checks.
//! - **Progress** ([`progress_channel`]): throttled [`ProgressEvent`]s for
//!   whoever is waiting on a load.

pub mod error;
mod fetcher;
mod models;
pub mod progress;
mod retry;
mod source;
mod speed;
mod tiers;

pub use crate::fetcher::{FetchConfig, FetchSnapshot, RangeFetcher};
pub use crate::models::{Descriptor, FileVersion, SourceInfo};
pub use crate::progress::{Phase, ProgressEvent, ProgressStream, ProgressTracker, progress_channel};
pub use crate::retry::Backoff;
#[cfg(any(test, feature = "mock"))]
pub use crate::source::MockSource;
pub use crate::source::{HttpSource, LocalSource, RangeSource, SourceHandle};
pub use crate::speed::{SpeedClass, SpeedThresholds};
pub use crate::tiers::TimeoutTiers;

//! Fixed-size page cache over a [`RangeFetcher`](rangedb_fetch::RangeFetcher).
//!
//! A remote file is split into pages of one configured size. Pages are keyed
//! by index *and* file version, so a republished file can never be served
//! from stale pages. Residency is bounded by bytes, with least-recently-used
//! eviction that skips pages pinned by an active [`Lease`].

mod cache;
pub mod error;
mod lru;

pub use crate::cache::{Lease, PageCache, PageCacheConfig, PageKey, PageSnapshot};

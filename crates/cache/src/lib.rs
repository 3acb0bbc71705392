//! Query result cache.
//!
//! Results are keyed by a [`Fingerprint`] of the canonical SQL text and its
//! parameters, and are only ever served for the file version they were
//! computed against.
//!
//! # Architecture
//! - **Memory tier**: shared rows for the running process, bounded by entry
//!   count and approximate size.
//! - **Durable tier**: an optional SQLite database holding serialized rows so
//!   results survive reloads. It is a cache, not a source of truth; deleting
//!   it only costs recomputation.
//!
//! Both tiers evict using the same [`Scorer`]. Lifetimes come from the
//! query's [`TtlClass`].

mod cache;
mod db;
pub mod error;
mod fingerprint;
mod memory;
mod models;
mod repo;
mod score;
mod ttl;

pub use crate::cache::{CacheSnapshot, ResultCache, ResultCacheConfig};
pub use crate::db::Database;
pub use crate::fingerprint::Fingerprint;
pub use crate::repo::Repository;
pub use crate::score::Scorer;
pub use crate::ttl::{TtlClass, TtlPolicy};

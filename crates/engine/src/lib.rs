//! Read-only SQL over a partially downloaded SQLite file.
//!
//! # Architecture
//! - **[`Backing`]**: where the file's bytes come from, either the page cache
//!   (fetching on demand) or a complete in-memory copy.
//! - **VFS**: a per-engine SQLite virtual file system that serves the main
//!   database from the backing and delegates temporary files to the platform.
//! - **[`QueryEngine`]**: worker threads, each with one read-only connection,
//!   fed over a channel. Queries carry a deadline and a cancellation token.

mod engine;
pub mod error;
mod reader;
#[cfg(test)]
mod testing;
mod value;
mod vfs;

pub use crate::engine::{EngineConfig, EngineSnapshot, QueryEngine};
pub use crate::reader::Backing;
pub use crate::value::{Rows, Value};

//! Layered configuration for rangedb.
//!
//! Sources, later ones winning:
//! 1. built-in defaults,
//! 2. an optional TOML, YAML or JSON file,
//! 3. `RANGEDB_*` environment variables (`__` separates nested keys).
//!
//! The loaded [`Config`] is validated once and then converted into the
//! per-crate configuration types with its `*_config` methods.

mod config;
pub mod error;

pub use crate::config::{
    CacheConfig, ChunkingConfig, Config, LoaderConfig, ProbeConfig, ProgressConfig, RetryConfig, SourceConfig,
    TimeoutsConfig, TtlConfig, WorkerConfig,
};

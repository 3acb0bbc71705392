//! Query a remote, read-only SQLite file without downloading it first.
//!
//! A [`DatabaseHandle`] probes the source, fetches just the pages SQLite
//! needs through HTTP range requests, and answers queries as soon as the
//! first pages are in. Connections that are too slow, or servers without
//! range support, fall back to downloading the whole file.
//!
//! ```no_run
//! # async fn demo() -> rangedb::error::Result<()> {
//! let mut config = rangedb::Config::default();
//! config.source.url = Some("https://example.com/catalog.sqlite".into());
//! let db = rangedb::DatabaseHandle::open_url(config).await?;
//! let rows = db.execute("SELECT name FROM records WHERE id = ?", &[rangedb::Value::Integer(7)]).await?;
//! # Ok(())
//! # }
//! ```

mod controller;
pub mod error;
mod handle;
mod loader;
mod telemetry;

pub use crate::controller::{ControllerState, Strategy, Transition};
pub use crate::handle::{DatabaseHandle, QueryOptions};
pub use crate::loader::LoaderPhase;
pub use crate::telemetry::TelemetrySnapshot;

pub use rangedb_cache::TtlClass;
pub use rangedb_config::Config;
pub use rangedb_engine::{Rows, Value};
pub use rangedb_fetch::{HttpSource, LocalSource, Phase, ProgressEvent, ProgressStream, RangeSource, SourceHandle};

#![allow(dead_code)]

use rangedb::{Config, DatabaseHandle, Rows, SourceHandle};
use rangedb_fetch::MockSource;
use rusqlite::{Connection, params};
use std::ops::Range;
use std::sync::Arc;

pub const SQLITE_PAGE: u64 = 4096;

pub struct Fixture {
    pub bytes: Vec<u8>,
    /// Byte span of the `records_year` index, which is written after the
    /// table and so occupies the end of the file.
    pub index_region: Range<u64>,
}

/// A `records` table with `rows` rows of `padding` bytes each.
pub fn records(rows: usize, padding: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "PRAGMA page_size = 4096;
         CREATE TABLE records (id INTEGER PRIMARY KEY, name TEXT NOT NULL, year INTEGER NOT NULL, padding BLOB);",
    )
    .unwrap();
    let tx = conn.unchecked_transaction().unwrap();
    {
        let mut insert = tx.prepare("INSERT INTO records (id, name, year, padding) VALUES (?1, ?2, ?3, zeroblob(?4))").unwrap();
        for id in 0..rows as i64 {
            insert.execute(params![id, format!("record-{id}"), 1900 + id % 120, padding as i64]).unwrap();
        }
    }
    tx.commit().unwrap();
    let before: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0)).unwrap();
    conn.execute_batch("CREATE INDEX records_year ON records (year);").unwrap();
    let after: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0)).unwrap();
    drop(conn);
    Fixture { bytes: std::fs::read(path).unwrap(), index_region: before * SQLITE_PAGE..after * SQLITE_PAGE }
}

/// Defaults with quick retries and no durable result cache.
pub fn config() -> Config {
    let mut config = Config::default();
    config.cache.durable = false;
    config.retry.base_backoff_ms = 1;
    config.progress.interval_ms = 10;
    config
}

pub async fn open(source: &Arc<MockSource>, config: Config) -> DatabaseHandle {
    DatabaseHandle::open(config, Arc::clone(source) as SourceHandle).await.unwrap()
}

pub fn network_calls(source: &MockSource) -> u64 {
    source.probes() + source.range_requests() + source.full_downloads()
}

pub fn single_integer(rows: &Rows) -> i64 {
    rows.rows[0][0].as_i64().unwrap()
}

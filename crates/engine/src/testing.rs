//! Fixture databases for engine tests.

use crate::engine::{EngineConfig, QueryEngine};
use crate::reader::Backing;
use rangedb_fetch::{FetchConfig, MockSource, RangeFetcher, RangeSource};
use rangedb_pages::{PageCache, PageCacheConfig};
use rusqlite::{Connection, params};
use std::sync::Arc;

/// Build a SQLite file with `rows` records and return its bytes.
pub(crate) fn fixture(rows: usize) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "PRAGMA page_size = 4096;
         CREATE TABLE records (id INTEGER PRIMARY KEY, name TEXT NOT NULL, year INTEGER NOT NULL, score REAL);
         CREATE INDEX records_year ON records (year);",
    )
    .unwrap();
    let tx = conn.unchecked_transaction().unwrap();
    {
        let mut insert = tx.prepare("INSERT INTO records (id, name, year, score) VALUES (?1, ?2, ?3, ?4)").unwrap();
        for id in 0..rows as i64 {
            insert.execute(params![id, format!("record-{id}"), 1950 + id % 75, id as f64 / 10.0]).unwrap();
        }
    }
    tx.commit().unwrap();
    drop(conn);
    std::fs::read(path).unwrap()
}

pub(crate) async fn paged_engine(source: MockSource, config: EngineConfig) -> (Arc<MockSource>, QueryEngine) {
    let source = Arc::new(source);
    let info = source.probe().await.unwrap();
    let fetcher = Arc::new(RangeFetcher::new(source.clone(), FetchConfig::default()));
    let pages = PageCache::new(fetcher, info.size, PageCacheConfig { page_size: 4096, ..PageCacheConfig::default() });
    let engine = QueryEngine::start(Backing::Paged(pages), info.version, config).unwrap();
    (source, engine)
}

//! SQLite pool behind the durable result tier.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{ErrorKind, Result};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Lookups run on every query; writes only follow a miss.
const FILE_CONNECTIONS: u32 = 4;
/// Misses that finish together all write back at once.
const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);
/// Settings `SqliteConnectOptions` has no builder for. Run on every pooled
/// connection.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA wal_autocheckpoint = 800;
    PRAGMA cache_size = -4096;
    PRAGMA temp_store = MEMORY;
";

/// Where the durable tier keeps its rows.
enum Location<'a> {
    File(&'a Path),
    /// Private to a single connection, gone once the pool closes.
    Memory,
}

impl Location<'_> {
    fn options(&self) -> SqliteConnectOptions {
        let options = SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            // Evicted payloads make room for ones of similar size.
            .auto_vacuum(SqliteAutoVacuum::None);
        match self {
            Self::File(path) => options.filename(path).create_if_missing(true),
            Self::Memory => options.filename(":memory:"),
        }
    }

    fn max_connections(&self) -> u32 {
        match self {
            Self::File(_) => FILE_CONNECTIONS,
            Self::Memory => 1,
        }
    }
}

/// Migrated connection pool for the durable result tier.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the result database at `path`, creating the file if needed. The
    /// parent directory must already exist.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Location::File(path.as_ref())).await
    }

    /// A throwaway database, also used by the tests of dependent crates.
    pub async fn connect_in_memory() -> Result<Self> {
        Self::open(Location::Memory).await
    }

    #[instrument(level = "debug", skip_all)]
    async fn open(location: Location<'_>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, _| Box::pin(async move { configure(conn).await }))
            .max_connections(location.max_connections())
            .connect_with(location.options())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        debug!("result database ready");
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Refresh planner statistics and close the pool once every connection
    /// is back. Do not use the database afterwards.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

async fn configure(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::Executor::execute(conn, sqlx::raw_sql(CONNECTION_PRAGMAS)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::connect_in_memory().await.unwrap();
        let (tables,): (i64,) = sqlx::query_as("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'results'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(tables, 1);
        // Already applied.
        db.migrate().await.unwrap();
        db.close().await;
        assert!(db.pool().is_closed());
    }

    #[tokio::test]
    async fn test_connection_pragmas() {
        let db = Database::connect_in_memory().await.unwrap();
        let (checkpoint,): (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint").fetch_one(db.pool()).await.unwrap();
        assert_eq!(checkpoint, 800);
        let (temp_store,): (i64,) = sqlx::query_as("PRAGMA temp_store").fetch_one(db.pool()).await.unwrap();
        assert_eq!(temp_store, 2);
        db.close().await;
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.sqlite");
        let db = Database::connect(&path).await.unwrap();
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(db.pool()).await.unwrap();
        assert_eq!(mode, "wal");
        db.close().await;
        assert!(path.exists());
    }
}

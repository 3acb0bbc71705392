//! Repository for the durable tier's `results` table.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::fingerprint::Fingerprint;
use crate::models::{CandidateRow, ResultRow};
use exn::ResultExt;
use sqlx::SqlitePool;

/// Typed access to stored results. Timestamps are Unix milliseconds.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Read
    // =========================================================================

    pub(crate) async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRow>> {
        sqlx::query_as(include_str!("../queries/get_result.sql"))
            .bind(fingerprint.to_hex())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_results.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("count"))
    }

    /// Sum of stored payload sizes in bytes.
    pub async fn total_size(&self) -> Result<u64> {
        let size: i64 = sqlx::query_scalar(include_str!("../queries/total_size.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(size).or_raise(|| ErrorKind::InvalidData("total size"))
    }

    /// Every entry's ranking columns, least recently accessed first.
    pub(crate) async fn eviction_candidates(&self) -> Result<Vec<CandidateRow>> {
        sqlx::query_as(include_str!("../queries/list_eviction_candidates.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Insert or replace an entry. Replacing resets its hit count.
    pub(crate) async fn upsert(&self, row: &ResultRow) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_result.sql"))
            .bind(&row.fingerprint)
            .bind(&row.file_version)
            .bind(&row.ttl_class)
            .bind(&row.payload)
            .bind(row.payload_size)
            .bind(row.created_at)
            .bind(row.expires_at)
            .bind(row.last_access_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Record a read.
    pub(crate) async fn touch(&self, fingerprint: &Fingerprint, now: i64) -> Result<()> {
        sqlx::query(include_str!("../queries/touch_result.sql"))
            .bind(now)
            .bind(fingerprint.to_hex())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Returns `true` if an entry was deleted.
    pub(crate) async fn delete(&self, fingerprint: &str) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_result.sql"))
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every entry that expired at or before `now`.
    pub async fn purge_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/purge_expired.sql"))
            .bind(now)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttl::TtlClass;
    use rangedb_engine::{Rows, Value};
    use rangedb_fetch::FileVersion;

    async fn repo() -> Repository {
        Repository::from(&Database::connect_in_memory().await.unwrap())
    }

    fn row(sql: &str, created_at: i64, expires_at: i64) -> ResultRow {
        let rows = Rows { columns: vec!["n".into()], rows: vec![vec![Value::Integer(42)]] };
        let fingerprint = Fingerprint::of(sql, &[]);
        ResultRow::new(&fingerprint, &FileVersion::new("v1"), TtlClass::Derived, &rows, created_at, expires_at).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let repo = repo().await;
        let stored = row("SELECT 42", 1_000, 2_000);
        repo.upsert(&stored).await.unwrap();

        let loaded = repo.get(&Fingerprint::of("SELECT 42", &[])).await.unwrap().unwrap();
        assert_eq!(loaded.file_version, "v1");
        assert_eq!(loaded.ttl_class().unwrap(), TtlClass::Derived);
        assert_eq!(loaded.rows().unwrap().rows[0][0], Value::Integer(42));
        assert_eq!(repo.total_size().await.unwrap(), stored.payload.len() as u64);
        assert!(repo.get(&Fingerprint::of("SELECT 43", &[])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_counts_hits() {
        let repo = repo().await;
        repo.upsert(&row("SELECT 42", 1_000, 2_000)).await.unwrap();
        let fingerprint = Fingerprint::of("SELECT 42", &[]);
        repo.touch(&fingerprint, 1_500).await.unwrap();
        repo.touch(&fingerprint, 1_600).await.unwrap();
        let loaded = repo.get(&fingerprint).await.unwrap().unwrap();
        assert_eq!(loaded.hits(), 2);
        assert_eq!(loaded.last_access_at, 1_600);

        // Replacing the entry starts its statistics over.
        repo.upsert(&row("SELECT 42", 3_000, 4_000)).await.unwrap();
        assert_eq!(repo.get(&fingerprint).await.unwrap().unwrap().hits(), 0);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_and_delete() {
        let repo = repo().await;
        repo.upsert(&row("SELECT 1", 0, 100)).await.unwrap();
        repo.upsert(&row("SELECT 2", 0, 200)).await.unwrap();
        repo.upsert(&row("SELECT 3", 0, 300)).await.unwrap();
        assert_eq!(repo.purge_expired(200).await.unwrap(), 2);
        assert_eq!(repo.count().await.unwrap(), 1);

        let remaining = Fingerprint::of("SELECT 3", &[]).to_hex();
        assert!(repo.delete(&remaining).await.unwrap());
        assert!(!repo.delete(&remaining).await.unwrap());
        assert_eq!(repo.total_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_eviction_candidates_oldest_first() {
        let repo = repo().await;
        repo.upsert(&row("SELECT 1", 500, 10_000)).await.unwrap();
        repo.upsert(&row("SELECT 2", 100, 10_000)).await.unwrap();
        let candidates = repo.eviction_candidates().await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].fingerprint, Fingerprint::of("SELECT 2", &[]).to_hex());
        assert!(candidates.iter().all(|candidate| candidate.payload_size > 0 && candidate.hits == 0));
    }
}

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::fingerprint::Fingerprint;
use crate::memory::{MemoryEntry, MemoryTier};
use crate::models::ResultRow;
use crate::repo::Repository;
use crate::score::Scorer;
use crate::ttl::{TtlClass, TtlPolicy};
use exn::Exn;
use rangedb_asyncutils::SingleFlight;
use rangedb_engine::Rows;
use rangedb_engine::error::ErrorKind as EngineErrorKind;
use rangedb_fetch::FileVersion;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

type Shared = std::result::Result<Arc<Rows>, EngineErrorKind>;

#[derive(Debug, Clone, PartialEq)]
pub struct ResultCacheConfig {
    pub memory_bytes: usize,
    pub memory_entries: usize,
    /// Quota for stored payloads in the durable tier.
    pub durable_bytes: u64,
    pub ttl: TtlPolicy,
    pub scorer: Scorer,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 50 * 1024 * 1024,
            memory_entries: 1000,
            durable_bytes: 200 * 1024 * 1024,
            ttl: TtlPolicy::default(),
            scorer: Scorer::default(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time result cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    /// Misses that waited on a computation already in flight.
    pub coalesced: u64,
    pub evictions: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
}
impl CacheSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.memory_hits + self.durable_hits;
        let total = hits + self.misses;
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }
}

struct Durable {
    db: Database,
    repo: Repository,
}

struct Inner {
    memory: Mutex<MemoryTier>,
    durable: Option<Durable>,
    config: ResultCacheConfig,
    /// Keyed by file version too, so a computation started against an old
    /// version is never shared with a caller reading a newer one.
    flights: SingleFlight<(Fingerprint, FileVersion), Shared>,
    stats: CacheStats,
}

impl Inner {
    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Two-tier cache of query results.
///
/// The memory tier holds shared [`Rows`] for the current process; the
/// optional durable tier persists them in SQLite so they survive reloads.
/// Both tiers evict by the same recency/frequency [`Scorer`], and entries
/// expire by [`TtlClass`] counted from when they were computed. An entry
/// computed against a different file version is never served.
///
/// Cloning is cheap; clones share both tiers.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.inner.config)
            .field("durable", &self.inner.durable.is_some())
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    fn build(config: ResultCacheConfig, durable: Option<Database>) -> Self {
        let memory = MemoryTier::new(config.memory_bytes, config.memory_entries, config.scorer);
        let durable = durable.map(|db| Durable { repo: Repository::from(&db), db });
        Self {
            inner: Arc::new(Inner {
                memory: Mutex::new(memory),
                durable,
                config,
                flights: SingleFlight::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// A cache that forgets everything when dropped.
    pub fn memory_only(config: ResultCacheConfig) -> Self {
        Self::build(config, None)
    }

    /// A cache backed by an already connected database.
    pub fn with_database(config: ResultCacheConfig, db: Database) -> Self {
        Self::build(config, Some(db))
    }

    /// A cache persisted in the SQLite file at `path`.
    pub async fn open(config: ResultCacheConfig, path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::connect(path).await?;
        Ok(Self::with_database(config, db))
    }

    pub fn config(&self) -> &ResultCacheConfig {
        &self.inner.config
    }

    /// Look up a live result computed against `version`.
    ///
    /// Problems with the durable tier are logged and treated as a miss.
    #[instrument(level = "debug", skip_all, fields(%fingerprint))]
    pub async fn get(&self, fingerprint: &Fingerprint, version: &FileVersion) -> Option<Arc<Rows>> {
        let now = now_ms();
        let cached = self.inner.memory().get(fingerprint, version, now);
        if let Some(rows) = cached {
            self.inner.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            trace!("memory hit");
            return Some(rows);
        }
        match self.get_durable(fingerprint, version, now).await {
            Ok(Some(rows)) => {
                self.inner.stats.durable_hits.fetch_add(1, Ordering::Relaxed);
                debug!("durable hit");
                return Some(rows);
            },
            Ok(None) => {},
            Err(err) => warn!(error = ?err, "durable result cache lookup failed"),
        }
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!("miss");
        None
    }

    async fn get_durable(&self, fingerprint: &Fingerprint, version: &FileVersion, now: i64) -> Result<Option<Arc<Rows>>> {
        let Some(durable) = &self.inner.durable else {
            return Ok(None);
        };
        let Some(row) = durable.repo.get(fingerprint).await? else {
            return Ok(None);
        };
        if row.expires_at <= now || row.file_version != version.as_str() {
            durable.repo.delete(&row.fingerprint).await?;
            return Ok(None);
        }
        let rows = match row.rows() {
            Ok(rows) => Arc::new(rows),
            Err(err) => {
                durable.repo.delete(&row.fingerprint).await?;
                return Err(err);
            },
        };
        durable.repo.touch(fingerprint, now).await?;
        // Promote, keeping the original expiry.
        let entry = MemoryEntry::new(Arc::clone(&rows), version.clone(), row.expires_at, now, row.hits() + 1);
        self.insert_memory(*fingerprint, entry, now);
        Ok(Some(rows))
    }

    fn insert_memory(&self, fingerprint: Fingerprint, entry: MemoryEntry, now: i64) {
        let evicted = self.inner.memory().insert(fingerprint, entry, now);
        if evicted > 0 {
            self.inner.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    /// Store a result in both tiers.
    #[instrument(level = "debug", skip_all, fields(%fingerprint, %ttl))]
    pub async fn put(&self, fingerprint: Fingerprint, version: &FileVersion, rows: Arc<Rows>, ttl: TtlClass) -> Result<()> {
        let now = now_ms();
        let lifetime = i64::try_from(self.inner.config.ttl.ttl(ttl).as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(lifetime);
        let entry = MemoryEntry::new(Arc::clone(&rows), version.clone(), expires_at, now, 0);
        self.insert_memory(fingerprint, entry, now);

        if let Some(durable) = &self.inner.durable {
            let row = ResultRow::new(&fingerprint, version, ttl, &rows, now, expires_at)?;
            durable.repo.upsert(&row).await?;
            self.enforce_quota(durable, now).await?;
        }
        Ok(())
    }

    /// Evict the lowest scoring durable entries until the tier is back under
    /// its quota.
    async fn enforce_quota(&self, durable: &Durable, now: i64) -> Result<()> {
        let quota = self.inner.config.durable_bytes;
        let mut total = durable.repo.total_size().await?;
        if total <= quota {
            return Ok(());
        }
        let mut candidates = durable.repo.eviction_candidates().await?;
        let scorer = self.inner.config.scorer;
        candidates.sort_by(|a, b| {
            let a = scorer.score(now, a.last_access_at, u64::try_from(a.hits).unwrap_or(0));
            let b = scorer.score(now, b.last_access_at, u64::try_from(b.hits).unwrap_or(0));
            a.total_cmp(&b)
        });
        let mut evicted = 0;
        for candidate in candidates {
            if total <= quota {
                break;
            }
            if durable.repo.delete(&candidate.fingerprint).await? {
                total = total.saturating_sub(u64::try_from(candidate.payload_size).unwrap_or(0));
                evicted += 1;
            }
        }
        self.inner.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, total, quota, "durable tier over quota");
        Ok(())
    }

    /// Return the cached result for `fingerprint`, or compute, store and
    /// return it.
    ///
    /// Concurrent misses for the same fingerprint share one computation. The
    /// token handed to `compute` is cancelled once every caller waiting on it
    /// has given up. Failed computations are not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        version: &FileVersion,
        ttl: TtlClass,
        compute: F,
    ) -> Result<Arc<Rows>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Rows, EngineErrorKind>> + Send + 'static,
    {
        if let Some(rows) = self.get(&fingerprint, version).await {
            return Ok(rows);
        }
        let cache = self.clone();
        let version = version.clone();
        let outcome = self
            .inner
            .flights
            .run((fingerprint, version.clone()), move |token| async move {
                let rows = Arc::new(compute(token).await?);
                if let Err(err) = cache.put(fingerprint, &version, Arc::clone(&rows), ttl).await {
                    warn!(error = ?err, "could not store computed result");
                }
                Ok::<_, EngineErrorKind>(rows)
            })
            .await;
        match outcome {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(kind)) => exn::bail!(ErrorKind::Compute(kind)),
            Err(abandoned) => Err(Exn::from(abandoned).raise(ErrorKind::Abandoned)),
        }
    }

    /// Drop expired entries from both tiers, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = now_ms();
        let mut purged = self.inner.memory().purge_expired(now) as u64;
        if let Some(durable) = &self.inner.durable {
            purged += durable.repo.purge_expired(now).await?;
        }
        Ok(purged)
    }

    /// Forget everything held in memory; the durable tier is untouched.
    pub fn clear_memory(&self) {
        let config = &self.inner.config;
        *self.inner.memory() = MemoryTier::new(config.memory_bytes, config.memory_entries, config.scorer);
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let memory = self.inner.memory();
        let stats = &self.inner.stats;
        CacheSnapshot {
            memory_hits: stats.memory_hits.load(Ordering::Relaxed),
            durable_hits: stats.durable_hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            coalesced: self.inner.flights.snapshot().followers,
            evictions: stats.evictions.load(Ordering::Relaxed),
            memory_entries: memory.len(),
            memory_bytes: memory.bytes(),
        }
    }

    pub async fn close(&self) {
        if let Some(durable) = &self.inner.durable {
            durable.db.close().await;
        }
    }
}

fn now_ms() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

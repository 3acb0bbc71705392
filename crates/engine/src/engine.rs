use crate::error::{ErrorKind, Result};
use crate::reader::{Backing, FileReader};
use crate::value::{Rows, Value};
use crate::vfs::Registration;
use exn::ResultExt;
use rangedb_fetch::FileVersion;
use rangedb_pages::error::ErrorKind as PageErrorKind;
use rusqlite::{Connection, ErrorCode, OpenFlags, params_from_iter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Virtual machine instructions between cancellation checks.
const PROGRESS_OPS: i32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of SQL worker threads, each with its own connection.
    pub workers: usize,
    /// Deadline for a single query, measured from submission.
    pub query_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { workers: 2, query_timeout: Duration::from_secs(180) }
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    queries: AtomicU64,
    failures: AtomicU64,
    busy_micros: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub queries: u64,
    pub failures: u64,
    /// Total wall-clock time spent in `execute`, including queueing.
    pub busy: Duration,
}
impl EngineSnapshot {
    pub fn average_latency(&self) -> Option<Duration> {
        let queries = u32::try_from(self.queries).ok().filter(|queries| *queries > 0)?;
        Some(self.busy / queries)
    }
}

struct Job {
    sql: String,
    params: Vec<Value>,
    cancelled: Arc<AtomicBool>,
    reply: oneshot::Sender<std::result::Result<Rows, ErrorKind>>,
}

struct Inner {
    reader: Arc<FileReader>,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: EngineConfig,
    stats: EngineStats,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Closing the queue is enough; idle workers exit on their own.
        lock(&self.jobs).take();
    }
}

/// Executes read-only SQL against a database served through the page cache.
///
/// Every engine registers its own SQLite VFS and runs a small pool of worker
/// threads, each owning one connection opened through that VFS. Queries are
/// handed to the pool over a channel so SQLite never blocks the async
/// runtime, while page misses inside SQLite block only the worker that hit
/// them. Cloning is cheap; clones share the workers.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine").field("config", &self.inner.config).finish_non_exhaustive()
    }
}

impl QueryEngine {
    /// Register a VFS over `backing` and start the worker pool.
    ///
    /// Must be called from within a Tokio runtime; page reads made by the
    /// workers are driven by that runtime.
    pub fn start(backing: Backing, version: FileVersion, config: EngineConfig) -> Result<Self> {
        let handle = Handle::try_current().or_raise(|| ErrorKind::Vfs("no Tokio runtime".to_string()))?;
        let reader = Arc::new(FileReader::new(backing, version, handle));
        let registration = Arc::new(Registration::register(Arc::clone(&reader))?);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for index in 0..config.workers.max(1) {
            let registration = Arc::clone(&registration);
            let reader = Arc::clone(&reader);
            let rx = Arc::clone(&rx);
            let worker = std::thread::Builder::new()
                .name(format!("rangedb-sql-{index}"))
                .spawn(move || run_worker(&registration, &reader, &rx))
                .or_raise(|| ErrorKind::Vfs(format!("could not spawn SQL worker {index}")))?;
            workers.push(worker);
        }
        info!(vfs = registration.name(), workers = workers.len(), "query engine started");

        Ok(Self {
            inner: Arc::new(Inner {
                reader,
                jobs: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
                config,
                stats: EngineStats::default(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn backing(&self) -> Backing {
        self.inner.reader.backing()
    }

    /// Serve the database from `backing` from now on. The new backing must
    /// be the same size as the old one.
    pub fn swap_backing(&self, backing: Backing) -> Result<()> {
        self.inner.reader.swap(backing)?;
        info!("query engine switched backing");
        Ok(())
    }

    /// Run one read-only statement and collect every row.
    ///
    /// Cancelling `cancel` resolves the call immediately with
    /// [`ErrorKind::Cancelled`]; the worker stops at its next page fetch or
    /// progress check.
    #[instrument(level = "debug", skip(self, params, cancel), fields(params = params.len()))]
    pub async fn execute(&self, sql: &str, params: &[Value], cancel: &CancellationToken) -> Result<Rows> {
        let started = Instant::now();
        let outcome = self.submit(sql, params, cancel).await;
        let stats = &self.inner.stats;
        stats.queries.fetch_add(1, Ordering::Relaxed);
        stats.busy_micros.fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if outcome.is_err() {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    async fn submit(&self, sql: &str, params: &[Value], cancel: &CancellationToken) -> Result<Rows> {
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply_tx, mut reply) = oneshot::channel();
        let job = Job {
            sql: sql.to_string(),
            params: params.to_vec(),
            cancelled: Arc::clone(&cancelled),
            reply: reply_tx,
        };
        let sent = lock(&self.inner.jobs).as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
        if !sent {
            exn::bail!(ErrorKind::Shutdown);
        }

        let deadline = self.inner.config.query_timeout;
        let waited = tokio::time::timeout(deadline, async {
            tokio::select! {
                reply = &mut reply => Some(reply),
                () = cancel.cancelled() => None,
            }
        })
        .await;
        match waited {
            Ok(Some(Ok(outcome))) => outcome.map_err(exn::Exn::from),
            Ok(Some(Err(_))) => exn::bail!(ErrorKind::Shutdown),
            Ok(None) => {
                cancelled.store(true, Ordering::Release);
                debug!("query cancelled by caller");
                exn::bail!(ErrorKind::Cancelled)
            },
            Err(_) => {
                cancelled.store(true, Ordering::Release);
                warn!(timeout_ms = deadline.as_millis() as u64, "query deadline exceeded");
                exn::bail!(ErrorKind::Timeout(deadline))
            },
        }
    }

    /// Check that the database header and schema are readable.
    pub async fn verify(&self) -> Result<()> {
        self.execute("SELECT count(*) FROM sqlite_schema", &[], &CancellationToken::new()).await?;
        Ok(())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let stats = &self.inner.stats;
        EngineSnapshot {
            queries: stats.queries.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            busy: Duration::from_micros(stats.busy_micros.load(Ordering::Relaxed)),
        }
    }

    /// Stop accepting queries and wait for the workers to finish what they
    /// are running.
    pub async fn shutdown(&self) {
        lock(&self.inner.jobs).take();
        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        if workers.is_empty() {
            return;
        }
        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                _ = worker.join();
            }
        })
        .await;
        if joined.is_err() {
            warn!("SQL workers did not shut down cleanly");
        }
        info!("query engine shut down");
    }
}

// ====================================================================================================================
// Workers
// ====================================================================================================================

fn run_worker(registration: &Arc<Registration>, reader: &FileReader, jobs: &Mutex<mpsc::Receiver<Job>>) {
    // `registration` outlives this function, so the connection is always
    // closed before the VFS can be unregistered.
    let conn = match open(registration) {
        Ok(conn) => Some(conn),
        Err(err) => {
            warn!(error = %err, "SQL worker could not open the database");
            None
        },
    };
    loop {
        let job = lock(jobs).recv();
        let Ok(job) = job else {
            break;
        };
        let outcome = match &conn {
            Some(conn) => run_job(conn, reader, &job),
            None => Err(ErrorKind::Vfs("worker has no database connection".to_string())),
        };
        _ = job.reply.send(outcome);
    }
}

fn open(registration: &Registration) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let path = format!("file:{}?immutable=1", registration.name());
    let conn = Connection::open_with_flags_and_vfs(path, flags, registration.name())?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(conn)
}

fn run_job(conn: &Connection, reader: &FileReader, job: &Job) -> std::result::Result<Rows, ErrorKind> {
    if job.cancelled.load(Ordering::Acquire) {
        return Err(ErrorKind::Cancelled);
    }
    let scope = reader.enter(Arc::clone(&job.cancelled));
    let flag = Arc::clone(&job.cancelled);
    conn.progress_handler(PROGRESS_OPS, Some(move || flag.load(Ordering::Acquire)));
    let outcome = query(conn, &job.sql, &job.params);
    conn.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);
    outcome.map_err(|err| match (err, scope.take_failure()) {
        (_, Some(PageErrorKind::Cancelled)) => ErrorKind::Cancelled,
        (_, Some(kind)) => ErrorKind::Page(kind),
        (QueryError::Sqlite(err), None) if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) => {
            ErrorKind::Cancelled
        },
        (QueryError::Sqlite(err), None) => ErrorKind::Query(err.to_string()),
        (QueryError::NotReadOnly, None) => ErrorKind::Query("only read-only statements are allowed".to_string()),
    })
}

enum QueryError {
    Sqlite(rusqlite::Error),
    NotReadOnly,
}

impl From<rusqlite::Error> for QueryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(err)
    }
}

fn query(conn: &Connection, sql: &str, params: &[Value]) -> std::result::Result<Rows, QueryError> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(QueryError::NotReadOnly);
    }
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.query(params_from_iter(params))?;
    while let Some(row) = cursor.next()? {
        let values: Vec<Value> =
            (0..width).map(|index| row.get_ref(index).map(Value::from)).collect::<rusqlite::Result<_>>()?;
        rows.push(values);
    }
    Ok(Rows { columns, rows })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, paged_engine};
    use bytes::Bytes;
    use rangedb_fetch::MockSource;
    use rangedb_fetch::error::ErrorKind as FetchErrorKind;

    fn whole_engine(data: Vec<u8>) -> QueryEngine {
        QueryEngine::start(Backing::Whole(Bytes::from(data)), FileVersion::new("v1"), EngineConfig::default()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_whole_file_queries() {
        let engine = whole_engine(fixture(200));
        let token = CancellationToken::new();
        let rows = engine.execute("SELECT count(*) AS n FROM records", &[], &token).await.unwrap();
        assert_eq!(rows.get(0, "n"), Some(&Value::Integer(200)));

        let params = [Value::from(7)];
        let rows = engine.execute("SELECT id, name FROM records WHERE id = ?1", &params, &token).await.unwrap();
        assert_eq!(rows.columns, ["id", "name"]);
        assert_eq!(rows.get(0, "name").and_then(Value::as_str), Some("record-7"));
        engine.verify().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_paged_queries_reuse_cached_pages() {
        let (source, engine) = paged_engine(MockSource::new(fixture(2_000)), EngineConfig::default()).await;
        let token = CancellationToken::new();
        let sql = "SELECT count(*) FROM records WHERE year >= 2000";
        let first = engine.execute(sql, &[], &token).await.unwrap();
        let requests = source.range_requests();
        assert!(requests > 0);

        let second = engine.execute(sql, &[], &token).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.range_requests(), requests);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejects_writes_and_bad_sql() {
        let engine = whole_engine(fixture(10));
        let token = CancellationToken::new();
        for sql in ["DELETE FROM records", "CREATE TABLE t(x)", "SELEKT 1", "SELECT * FROM missing"] {
            let err = engine.execute(sql, &[], &token).await.unwrap_err();
            assert!(matches!(*err, ErrorKind::Query(_)), "{sql}: {err:?}");
        }
        assert_eq!(engine.snapshot().failures, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_before_submission() {
        let engine = whole_engine(fixture(10));
        let token = CancellationToken::new();
        token.cancel();
        let err = engine.execute("SELECT 1", &[], &token).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelling_one_query_leaves_others_intact() {
        let source = MockSource::new(fixture(2_000)).with_latency(Duration::from_millis(100));
        let (_, engine) = paged_engine(source, EngineConfig::default()).await;
        let doomed = CancellationToken::new();
        let q = {
            let engine = engine.clone();
            let doomed = doomed.clone();
            tokio::spawn(async move { engine.execute("SELECT sum(score) FROM records", &[], &doomed).await })
        };
        let r = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.execute("SELECT count(*) FROM records", &[], &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        doomed.cancel();

        assert_eq!(*q.await.unwrap().unwrap_err(), ErrorKind::Cancelled);
        let rows = r.await.unwrap().unwrap();
        assert_eq!(rows.rows[0][0], Value::Integer(2_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_query_deadline() {
        let source = MockSource::new(fixture(100)).with_latency(Duration::from_millis(500));
        let config = EngineConfig { query_timeout: Duration::from_millis(50), ..EngineConfig::default() };
        let (_, engine) = paged_engine(source, config).await;
        let err = engine.execute("SELECT count(*) FROM records", &[], &CancellationToken::new()).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Timeout(Duration::from_millis(50)));
        assert!(err.is_retryable());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_page_failures_surface_with_their_cause() {
        let (source, engine) = paged_engine(MockSource::new(fixture(100)), EngineConfig::default()).await;
        source.replace(fixture(101)).await;
        let err = engine.execute("SELECT count(*) FROM records", &[], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::Page(_)), "{err:?}");
        assert!(matches!(err.fetch_kind(), Some(FetchErrorKind::Integrity(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_swap_to_whole_file() {
        let data = fixture(500);
        let (source, engine) = paged_engine(MockSource::new(data.clone()), EngineConfig::default()).await;
        assert!(engine.swap_backing(Backing::Whole(Bytes::from(vec![0u8; 10]))).is_err());
        engine.swap_backing(Backing::Whole(Bytes::from(data))).unwrap();
        assert!(!engine.backing().is_paged());

        let rows = engine.execute("SELECT count(*) FROM records", &[], &CancellationToken::new()).await.unwrap();
        assert_eq!(rows.rows[0][0], Value::Integer(500));
        assert_eq!(source.range_requests(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_rejects_new_queries() {
        let engine = whole_engine(fixture(10));
        engine.shutdown().await;
        let err = engine.execute("SELECT 1", &[], &CancellationToken::new()).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Shutdown);
    }

    #[test]
    fn test_average_latency() {
        let snapshot = EngineSnapshot { queries: 4, failures: 0, busy: Duration::from_millis(100) };
        assert_eq!(snapshot.average_latency(), Some(Duration::from_millis(25)));
        assert_eq!(EngineSnapshot::default().average_latency(), None);
    }
}

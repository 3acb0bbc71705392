use crate::controller::{Controller, ControllerState, Strategy, Transition};
use crate::error::{ErrorKind, Result};
use crate::loader::{LoaderPhase, Run};
use crate::telemetry::{QueryStats, TelemetrySnapshot};
use exn::ResultExt;
use rangedb_cache::error::ErrorKind as CacheErrorKind;
use rangedb_cache::{Fingerprint, ResultCache, TtlClass};
use rangedb_config::Config;
use rangedb_engine::{QueryEngine, Rows, Value};
use rangedb_fetch::error::ErrorKind as FetchErrorKind;
use rangedb_fetch::{FileVersion, HttpSource, ProgressStream, RangeFetcher, SourceHandle, SourceInfo, progress_channel};
use rangedb_pages::PageCache;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-query knobs for [`DatabaseHandle::execute_with`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How long the result may be served from the cache.
    pub ttl: TtlClass,
    /// Cancelling resolves the call with [`ErrorKind::Cancelled`] straight
    /// away. Work shared with other callers keeps running.
    pub cancel: CancellationToken,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { ttl: TtlClass::Derived, cancel: CancellationToken::new() }
    }
}

/// What a failed query means for the session as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Escalation {
    /// Pages can no longer be fetched in chunks, retries included.
    FullDownload(String),
    /// The file changed underneath the session.
    Fail(String),
}

impl Escalation {
    fn of(kind: &CacheErrorKind) -> Option<Self> {
        let CacheErrorKind::Compute(engine) = kind else {
            return None;
        };
        match engine.fetch_kind()? {
            fetch @ (FetchErrorKind::Network(_) | FetchErrorKind::Timeout(_) | FetchErrorKind::RangeUnsupported) => {
                Some(Self::FullDownload(fetch.to_string()))
            },
            FetchErrorKind::Integrity(detail) => {
                Some(Self::Fail(format!("the database changed on the server ({detail}), retry to load the new version")))
            },
            _ => None,
        }
    }
}

/// Everything tied to one version of the remote file.
#[derive(Clone, Default)]
pub(crate) struct Session {
    pub(crate) info: Option<SourceInfo>,
    pub(crate) fetcher: Option<Arc<RangeFetcher>>,
    pub(crate) pages: Option<PageCache>,
    pub(crate) engine: Option<QueryEngine>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) source: SourceHandle,
    pub(crate) results: ResultCache,
    pub(crate) controller: Controller,
    pub(crate) phase: watch::Sender<LoaderPhase>,
    pub(crate) session: Mutex<Session>,
    progress: Mutex<Option<ProgressStream>>,
    run: Mutex<Option<JoinHandle<()>>>,
    queries: QueryStats,
    closed: CancellationToken,
}

impl Inner {
    pub(crate) fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }
}

/// A queryable view of one remote SQLite file.
///
/// Opening a handle starts the progressive loader in the background; queries
/// wait until the database is usable. Results are cached by fingerprint, and
/// every handle owns its own caches, engine and controller. Cloning is cheap;
/// clones share everything.
///
/// Must be used from within a multi-threaded Tokio runtime: SQL runs on
/// dedicated threads that drive page fetches through the runtime.
#[derive(Clone)]
pub struct DatabaseHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("source", &self.inner.source.name())
            .field("state", &self.inner.controller.state())
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle {
    /// Open the database served by `source` and start loading it.
    ///
    /// Returns once the result cache is available; loading continues in the
    /// background. Use [`wait_for`](Self::wait_for) or
    /// [`watch_state`](Self::watch_state) to follow it.
    #[instrument(level = "info", skip_all, fields(source = source.name()))]
    pub async fn open(config: Config, source: SourceHandle) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let results = open_results(&config).await;
        let handle = Self {
            inner: Arc::new(Inner {
                config,
                source,
                results,
                controller: Controller::new(),
                phase: watch::Sender::new(LoaderPhase::Init),
                session: Mutex::new(Session::default()),
                progress: Mutex::new(None),
                run: Mutex::new(None),
                queries: QueryStats::default(),
                closed: CancellationToken::new(),
            }),
        };
        handle.start_run(Run::Load);
        Ok(handle)
    }

    /// Open the HTTP(S) source named in `config.source`.
    pub async fn open_url(config: Config) -> Result<Self> {
        let source = &config.source;
        let Some(url) = &source.url else {
            exn::bail!(ErrorKind::Config);
        };
        let mut http = HttpSource::new(url.as_str()).or_raise(|| ErrorKind::Config)?;
        if let Some(descriptor_url) = &source.descriptor_url {
            http = http.with_descriptor_url(descriptor_url.as_str());
        }
        for (name, value) in &source.request_headers {
            http = http.with_header(name, value).or_raise(|| ErrorKind::Config)?;
        }
        Self::open(config, Arc::new(http)).await
    }

    fn start_run(&self, run: Run) {
        let (tracker, stream) = progress_channel(self.inner.config.progress_interval());
        *lock(&self.inner.progress) = Some(stream);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(run, Arc::new(tracker)).await });
        if let Some(previous) = lock(&self.inner.run).replace(task) {
            previous.abort();
        }
    }

    /// Stop the current loader run and wait until it has let go of the
    /// session.
    async fn stop_run(&self) {
        let task = lock(&self.inner.run).take();
        if let Some(task) = task {
            task.abort();
            _ = task.await;
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Run a read-only statement with default [`QueryOptions`].
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Arc<Rows>> {
        self.execute_with(sql, params, QueryOptions::default()).await
    }

    /// Run a read-only statement.
    ///
    /// Waits for the database to become usable first. Identical statements
    /// (same canonical SQL and parameters) share one execution and are served
    /// from the result cache afterwards.
    #[instrument(level = "debug", skip(self, params, options), fields(params = params.len(), ttl = %options.ttl))]
    pub async fn execute_with(&self, sql: &str, params: &[Value], options: QueryOptions) -> Result<Arc<Rows>> {
        let started = Instant::now();
        let outcome = self.run_query(sql, params, &options).await;
        self.inner.queries.record(started.elapsed(), outcome.is_err());
        outcome
    }

    async fn run_query(&self, sql: &str, params: &[Value], options: &QueryOptions) -> Result<Arc<Rows>> {
        self.ensure_open()?;
        let fingerprint = Fingerprint::of(sql, params);
        let mut degraded = false;
        loop {
            let (engine, version) = self.ready(&options.cancel).await?;
            let compute = {
                let sql = sql.to_string();
                let params = params.to_vec();
                move |token: CancellationToken| async move {
                    engine.execute(&sql, &params, &token).await.map_err(|err| (*err).clone())
                }
            };
            let lookup = self.inner.results.get_or_compute(fingerprint, &version, options.ttl, compute);
            let err = tokio::select! {
                outcome = lookup => match outcome {
                    Ok(rows) => return Ok(rows),
                    Err(err) => err,
                },
                () = options.cancel.cancelled() => {
                    debug!("query cancelled by caller");
                    exn::bail!(ErrorKind::Cancelled)
                },
            };
            let kind = ErrorKind::from_cache(&err);
            match Escalation::of(&err) {
                Some(Escalation::FullDownload(reason)) if !degraded => {
                    if !self.degrade(reason, &version).await {
                        return Err(err.raise(kind));
                    }
                    degraded = true;
                    debug!("running query again once the whole file is loaded");
                },
                Some(Escalation::Fail(message)) => {
                    self.fail_session(message, &version).await;
                    return Err(err.raise(kind));
                },
                _ => return Err(err.raise(kind)),
            }
        }
    }

    /// Whether the current session reads `version` of the file.
    fn serves(&self, version: &FileVersion) -> bool {
        self.inner.session().info.as_ref().is_some_and(|info| info.version == *version)
    }

    /// Stop fetching pages for the rest of the session and download the
    /// whole file instead. Returns whether a query that failed against
    /// `version` is worth running again.
    async fn degrade(&self, reason: String, version: &FileVersion) -> bool {
        if !self.serves(version) {
            return false;
        }
        match self.inner.controller.state() {
            ControllerState::Ready(Strategy::Chunked) => {},
            // Another query got here first.
            ControllerState::DegradedFullDownload { .. } | ControllerState::Ready(Strategy::FullDownload) => return true,
            _ => return false,
        }
        if self.inner.controller.transition(ControllerState::DegradedFullDownload { reason: reason.clone() }) {
            warn!(%reason, "page fetches failed after loading, downloading the whole file");
            self.stop_run().await;
            self.start_run(Run::Recover);
        }
        true
    }

    /// Mark a ready session as failed so queries stop running against it
    /// until [`retry`](Self::retry) or [`reset`](Self::reset).
    async fn fail_session(&self, message: String, version: &FileVersion) {
        if !self.serves(version) || !self.inner.controller.state().is_ready() {
            return;
        }
        if self.inner.controller.transition(ControllerState::Failed { message: message.clone() }) {
            warn!(%message, "session failed");
            self.stop_run().await;
        }
    }

    /// Wait until the controller is ready and return the engine and the file
    /// version it serves.
    async fn ready(&self, cancel: &CancellationToken) -> Result<(QueryEngine, FileVersion)> {
        let mut states = self.inner.controller.subscribe();
        loop {
            let state = states.borrow_and_update().clone();
            match state {
                ControllerState::Ready(_) => {
                    let session = self.inner.session();
                    if let (Some(engine), Some(info)) = (&session.engine, &session.info) {
                        return Ok((engine.clone(), info.version.clone()));
                    }
                },
                ControllerState::Failed { message } => exn::bail!(ErrorKind::Unavailable(message)),
                _ => {},
            }
            tokio::select! {
                changed = states.changed() => changed.or_raise(|| ErrorKind::Closed)?,
                () = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                () = self.inner.closed.cancelled() => exn::bail!(ErrorKind::Closed),
            }
        }
    }

    /// Progress of the current loader run.
    ///
    /// Each run has exactly one stream, which ends when the run does; it can
    /// only be taken once.
    pub fn take_progress(&self) -> Option<ProgressStream> {
        lock(&self.inner.progress).take()
    }

    pub fn phase(&self) -> LoaderPhase {
        *self.inner.phase.borrow()
    }

    /// Wait until the loader has reached at least `phase`.
    ///
    /// Fails with [`ErrorKind::Unavailable`] if loading fails first.
    pub async fn wait_for(&self, phase: LoaderPhase) -> Result<()> {
        let mut phases = self.inner.phase.subscribe();
        let mut states = self.inner.controller.subscribe();
        loop {
            if *phases.borrow_and_update() >= phase {
                return Ok(());
            }
            if let ControllerState::Failed { message } = &*states.borrow_and_update() {
                exn::bail!(ErrorKind::Unavailable(message.clone()));
            }
            tokio::select! {
                changed = phases.changed() => changed.or_raise(|| ErrorKind::Closed)?,
                changed = states.changed() => changed.or_raise(|| ErrorKind::Closed)?,
                () = self.inner.closed.cancelled() => exn::bail!(ErrorKind::Closed),
            }
        }
    }

    pub fn controller_state(&self) -> ControllerState {
        self.inner.controller.state()
    }

    /// Subscribe to controller state changes.
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.inner.controller.subscribe()
    }

    /// Every controller transition so far, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.inner.controller.history()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        let session = self.inner.session().clone();
        TelemetrySnapshot::new(
            &self.inner.queries,
            session.fetcher.map(|fetcher| fetcher.snapshot()).unwrap_or_default(),
            session.pages.map(|pages| pages.snapshot()),
            self.inner.results.snapshot(),
            session.engine.map(|engine| engine.snapshot()),
        )
    }

    /// Start loading again after a failure, keeping cached pages and
    /// results. Does nothing unless the controller has failed.
    pub async fn retry(&self) -> Result<()> {
        self.ensure_open()?;
        if !matches!(self.inner.controller.state(), ControllerState::Failed { .. }) {
            debug!("retry ignored, loading has not failed");
            return Ok(());
        }
        self.stop_run().await;
        if let Some(fetcher) = &self.inner.session().fetcher {
            fetcher.detach_progress();
        }
        self.inner.controller.transition(ControllerState::Init);
        info!("retrying");
        self.start_run(Run::Load);
        Ok(())
    }

    /// Forget everything known about the remote file and load it from
    /// scratch. Cached results for the old file version stop being served.
    pub async fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        self.stop_run().await;
        self.discard_session().await;
        self.inner.controller.transition(ControllerState::Init);
        self.inner.phase.send_replace(LoaderPhase::Init);
        info!("reset");
        self.start_run(Run::Load);
        Ok(())
    }

    async fn discard_session(&self) {
        let session = std::mem::take(&mut *self.inner.session());
        if let Some(fetcher) = &session.fetcher {
            fetcher.detach_progress();
        }
        if let Some(engine) = &session.engine {
            engine.shutdown().await;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(())
    }

    /// Stop loading, shut the engine down and close the result cache.
    /// Queries in progress resolve with [`ErrorKind::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        self.stop_run().await;
        self.discard_session().await;
        lock(&self.inner.progress).take();
        self.inner.results.close().await;
        info!("database handle closed");
    }
}

async fn open_results(config: &Config) -> ResultCache {
    let cache_config = config.result_cache_config();
    let Some(path) = config.durable_path() else {
        return ResultCache::memory_only(cache_config);
    };
    if let Some(parent) = path.parent()
        && let Err(err) = tokio::fs::create_dir_all(parent).await
    {
        warn!(error = %err, path = %parent.display(), "could not create result cache directory");
    }
    match ResultCache::open(cache_config.clone(), &path).await {
        Ok(cache) => cache,
        Err(err) => {
            warn!(error = ?err, path = %path.display(), "durable result cache unavailable, keeping results in memory");
            ResultCache::memory_only(cache_config)
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

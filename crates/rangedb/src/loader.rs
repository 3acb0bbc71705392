//! Progressive loading.
//!
//! One run takes a handle from [`LoaderPhase::Init`] to
//! [`LoaderPhase::FullReady`]:
//!
//! 1. probe the source and measure the connection (fast tier),
//! 2. fetch the critical prefix and open the engine over the page cache
//!    (chunked budget for the measured speed),
//! 3. prefetch the important prefix in the background; the handle is already
//!    usable, and any page not prefetched is fetched on demand.
//!
//! If step 1 or 2 fails or runs out of time, the whole file is downloaded
//! instead, within whatever is left of the emergency tier. A handle that
//! was ready in chunks runs the same download, with a fresh emergency tier,
//! once queries can no longer fetch pages.

use crate::controller::{ControllerState, Strategy};
use crate::handle::Inner;
use derive_more::Display;
use rangedb_config::Config;
use rangedb_engine::error::ErrorKind as EngineErrorKind;
use rangedb_engine::{Backing, QueryEngine};
use rangedb_fetch::error::ErrorKind as FetchErrorKind;
use rangedb_fetch::{Phase, ProgressTracker, RangeFetcher, SourceInfo, SpeedClass};
use rangedb_pages::PageCache;
use rangedb_pages::error::ErrorKind as PageErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};

/// Chunked loading starts over once if the file changes underneath it.
const LOAD_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum LoaderPhase {
    #[display("init")]
    Init,
    /// The engine is open and queries can run.
    #[display("critical ready")]
    CriticalReady,
    /// The important prefix is resident.
    #[display("important ready")]
    ImportantReady,
    /// Loading is over; anything not resident is fetched on demand.
    #[display("full ready")]
    FullReady,
}

/// What a loader run sets out to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Run {
    /// Load from scratch, chunked first.
    Load,
    /// The controller has already degraded; download the whole file.
    Recover,
}

/// Why chunked loading was given up.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
enum Degradation {
    #[display("timed out after {}ms", _0.as_millis())]
    Timeout(Duration),
    #[display("source does not support range requests")]
    RangeUnsupported,
    #[display("file changed while loading: {_0}")]
    Integrity(String),
    #[display("{_0}")]
    Failed(String),
}

impl Degradation {
    fn from_fetch(kind: &FetchErrorKind) -> Self {
        match kind {
            FetchErrorKind::RangeUnsupported => Self::RangeUnsupported,
            FetchErrorKind::Integrity(detail) => Self::Integrity(detail.clone()),
            FetchErrorKind::Timeout(after) => Self::Timeout(*after),
            other => Self::Failed(other.to_string()),
        }
    }

    fn from_page(kind: &PageErrorKind) -> Self {
        kind.fetch_kind().map_or_else(|| Self::Failed(kind.to_string()), Self::from_fetch)
    }

    fn from_engine(kind: &EngineErrorKind) -> Self {
        kind.fetch_kind().map_or_else(|| Self::Failed(kind.to_string()), Self::from_fetch)
    }
}

/// The file as seen by the current chunked attempt.
struct Prepared {
    info: SourceInfo,
    pages: PageCache,
    speed: SpeedClass,
}

impl Inner {
    pub(crate) async fn run(&self, run: Run, tracker: Arc<ProgressTracker>) {
        match run {
            Run::Load => self.load(&tracker).await,
            Run::Recover => self.download_whole(Instant::now(), &tracker).await,
        }
    }

    #[instrument(level = "info", skip_all, fields(source = self.source.name()))]
    async fn load(&self, tracker: &Arc<ProgressTracker>) {
        let started = Instant::now();
        self.phase.send_replace(LoaderPhase::Init);
        self.controller.transition(ControllerState::ChunkedLoading);

        let degradation = match self.load_chunked(started, tracker).await {
            Ok(prepared) => {
                self.controller.transition(ControllerState::Ready(Strategy::Chunked));
                self.advance(LoaderPhase::CriticalReady);
                self.load_important(&prepared, tracker).await;
                self.advance(LoaderPhase::FullReady);
                self.finish(tracker);
                return;
            },
            Err(degradation) => degradation,
        };

        warn!(reason = %degradation, "chunked loading abandoned, downloading the whole file");
        self.controller.transition(ControllerState::DegradedFullDownload { reason: degradation.to_string() });
        self.download_whole(started, tracker).await;
    }

    /// Download the whole file within what is left of the emergency tier
    /// counted from `started`, and settle the controller either way.
    #[instrument(level = "info", skip_all, fields(source = self.source.name()))]
    async fn download_whole(&self, started: Instant, tracker: &Arc<ProgressTracker>) {
        let emergency = self.config.timeout_tiers().emergency;
        match timeout(emergency.saturating_sub(started.elapsed()), self.load_full(tracker)).await {
            Ok(Ok(())) => {
                self.controller.transition(ControllerState::Ready(Strategy::FullDownload));
                self.advance(LoaderPhase::FullReady);
            },
            Ok(Err(failure)) => self.fail(failure.to_string()),
            Err(_) => {
                let speed = self.session().fetcher.as_ref().and_then(|fetcher| fetcher.measured_speed());
                let speed = speed.unwrap_or(SpeedClass::VerySlow);
                self.fail(format!("{} (gave up after {}s)", speed.message(), emergency.as_secs()));
            },
        }
        self.finish(tracker);
    }

    fn advance(&self, phase: LoaderPhase) {
        self.phase.send_replace(phase);
        info!(%phase, "loader phase");
    }

    fn fail(&self, message: String) {
        warn!(%message, "loading failed");
        self.controller.transition(ControllerState::Failed { message });
    }

    /// End the run's progress stream.
    fn finish(&self, tracker: &ProgressTracker) {
        if let Some(fetcher) = &self.session().fetcher {
            fetcher.detach_progress();
        }
        tracker.finish();
    }

    async fn load_chunked(&self, started: Instant, tracker: &Arc<ProgressTracker>) -> Result<Prepared, Degradation> {
        let tiers = self.config.timeout_tiers();
        let mut attempt = 1;
        loop {
            // The speed is unknown until the probe has run, so it gets the
            // shortest tier.
            let prepared = match timeout(tiers.fast, self.prepare(tracker)).await {
                Ok(prepared) => prepared?,
                Err(_) => return Err(Degradation::Timeout(tiers.fast)),
            };
            if !prepared.info.accepts_ranges {
                return Err(Degradation::RangeUnsupported);
            }
            let budget = tiers.chunked_budget(prepared.speed);
            match timeout(budget.saturating_sub(started.elapsed()), self.load_critical(&prepared, tracker)).await {
                Ok(Ok(())) => return Ok(prepared),
                Ok(Err(Degradation::Integrity(detail))) if attempt < LOAD_ATTEMPTS => {
                    warn!(%detail, "file changed while loading, starting over");
                    self.forget_file().await;
                    attempt += 1;
                },
                Ok(Err(degradation)) => return Err(degradation),
                Err(_) => return Err(Degradation::Timeout(budget)),
            }
        }
    }

    /// Probe the source and set up the fetcher and page cache for the file
    /// it serves, reusing the existing ones if the file has not changed.
    async fn prepare(&self, tracker: &Arc<ProgressTracker>) -> Result<Prepared, Degradation> {
        tracker.begin_phase(Phase::Probe, self.config.probe.bytes);
        let existing = self.session().clone();
        let prober = match &existing.fetcher {
            Some(fetcher) => Arc::clone(fetcher),
            None => Arc::new(RangeFetcher::new(Arc::clone(&self.source), self.config.fetch_config())),
        };
        let info = prober.probe().await.map_err(|err| Degradation::from_fetch(&err))?;

        let (fetcher, pages) = match (existing.info, existing.fetcher, existing.pages) {
            (Some(known), Some(fetcher), Some(pages)) if known.version == info.version && known.size == info.size => {
                debug!("reusing cached pages");
                (fetcher, pages)
            },
            _ => {
                let config = self.effective_config(&info);
                let fetcher = Arc::new(RangeFetcher::new(Arc::clone(&self.source), config.fetch_config()));
                let pages = PageCache::new(Arc::clone(&fetcher), info.size, config.page_cache_config());
                (fetcher, pages)
            },
        };
        fetcher.attach_progress(Arc::clone(tracker));
        let speed = fetcher.speed_class(&info).await;
        info!(size = info.size, version = %info.version, %speed, ranges = info.accepts_ranges, "probed source");

        let mut session = self.session();
        session.info = Some(info.clone());
        session.fetcher = Some(fetcher);
        session.pages = Some(pages.clone());
        Ok(Prepared { info, pages, speed })
    }

    /// The configuration with any chunking overrides from the file's
    /// descriptor applied.
    fn effective_config(&self, info: &SourceInfo) -> Config {
        let mut config = self.config.clone();
        if let Some(descriptor) = &info.descriptor
            && let Err(err) = config.apply_descriptor(descriptor)
        {
            warn!(error = ?err, "ignoring chunking overrides from descriptor");
            config = self.config.clone();
        }
        config
    }

    async fn load_critical(&self, prepared: &Prepared, tracker: &ProgressTracker) -> Result<(), Degradation> {
        let Prepared { info, pages, .. } = prepared;
        let critical = self.config.loader.critical_prefix.min(info.size);
        tracker.begin_phase(Phase::Critical, critical);
        pages.prefetch(0..critical, &info.version).await.map_err(|err| Degradation::from_page(&err))?;

        self.shutdown_engine().await;
        let engine = QueryEngine::start(Backing::Paged(pages.clone()), info.version.clone(), self.config.engine_config())
            .map_err(|err| Degradation::from_engine(&err))?;
        // Kept even if verification fails, so a full download can swap the
        // backing instead of starting over.
        self.session().engine = Some(engine.clone());
        engine.verify().await.map_err(|err| Degradation::from_engine(&err))?;
        tracker.finish();
        info!(bytes = critical, "critical prefix loaded");
        Ok(())
    }

    async fn load_important(&self, prepared: &Prepared, tracker: &ProgressTracker) {
        let Prepared { info, pages, .. } = prepared;
        let start = self.config.loader.critical_prefix.min(info.size);
        let end = self.config.loader.important_prefix.min(info.size).max(start);
        if start == end {
            self.advance(LoaderPhase::ImportantReady);
            return;
        }
        tracker.begin_phase(Phase::Important, end - start);
        let budget = self.config.timeout_tiers().normal;
        match timeout(budget, pages.prefetch(start..end, &info.version)).await {
            Ok(Ok(fetched)) => {
                tracker.finish();
                info!(bytes = end - start, fetched, "important prefix loaded");
                self.advance(LoaderPhase::ImportantReady);
            },
            Ok(Err(err)) => warn!(error = ?err, "important prefetch failed, loading pages on demand"),
            Err(_) => {
                warn!(timeout_ms = budget.as_millis() as u64, "important prefetch timed out, loading pages on demand");
            },
        }
    }

    async fn load_full(&self, tracker: &Arc<ProgressTracker>) -> Result<(), Degradation> {
        let session = self.session().clone();
        let info = match &session.info {
            Some(info) => info.clone(),
            // A single attempt; whatever is left of the emergency tier bounds it.
            None => self.source.probe().await.map_err(|err| Degradation::from_fetch(&err))?,
        };
        let same_file = session.info.as_ref().is_some_and(|known| known.version == info.version);
        let fetcher = match (&session.fetcher, same_file) {
            (Some(fetcher), true) => Arc::clone(fetcher),
            _ => Arc::new(RangeFetcher::new(Arc::clone(&self.source), self.effective_config(&info).fetch_config())),
        };
        fetcher.attach_progress(Arc::clone(tracker));
        {
            let mut current = self.session();
            current.info = Some(info.clone());
            current.fetcher = Some(Arc::clone(&fetcher));
        }

        tracker.begin_phase(Phase::FullDownload, info.size);
        let bytes = fetcher.fetch_all(&info).await.map_err(|err| Degradation::from_fetch(&err))?;
        tracker.finish();

        let pages = session.pages.filter(|_| same_file);
        if let Some(pages) = &pages {
            let seeded = pages.populate(&bytes, &info.version);
            debug!(seeded, "seeded page cache from full download");
        }
        let whole = Backing::Whole(bytes);
        let engine = match session.engine.filter(|_| same_file) {
            Some(engine) => {
                engine.swap_backing(whole).map_err(|err| Degradation::from_engine(&err))?;
                engine
            },
            None => {
                self.shutdown_engine().await;
                QueryEngine::start(whole, info.version.clone(), self.config.engine_config())
                    .map_err(|err| Degradation::from_engine(&err))?
            },
        };
        {
            let mut current = self.session();
            current.pages = pages;
            current.engine = Some(engine.clone());
        }
        engine.verify().await.map_err(|err| Degradation::from_engine(&err))?;
        info!(bytes = info.size, "full download loaded");
        Ok(())
    }

    async fn shutdown_engine(&self) {
        let engine = self.session().engine.take();
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
    }

    /// Drop everything tied to the current file version.
    async fn forget_file(&self) {
        self.shutdown_engine().await;
        let mut session = self.session();
        if let Some(fetcher) = session.fetcher.take() {
            fetcher.detach_progress();
        }
        session.info = None;
        session.pages = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_phases_are_ordered() {
        assert!(LoaderPhase::Init < LoaderPhase::CriticalReady);
        assert!(LoaderPhase::CriticalReady < LoaderPhase::ImportantReady);
        assert!(LoaderPhase::ImportantReady < LoaderPhase::FullReady);
    }

    #[rstest]
    #[case(FetchErrorKind::RangeUnsupported, Degradation::RangeUnsupported)]
    #[case(FetchErrorKind::Integrity("etag".into()), Degradation::Integrity("etag".into()))]
    #[case(FetchErrorKind::Timeout(Duration::from_secs(2)), Degradation::Timeout(Duration::from_secs(2)))]
    #[case(FetchErrorKind::NotFound("db".into()), Degradation::Failed("source not found: db".into()))]
    fn test_degradation_from_fetch(#[case] kind: FetchErrorKind, #[case] expected: Degradation) {
        assert_eq!(Degradation::from_fetch(&kind), expected);
        let page = PageErrorKind::Fetch(kind);
        assert_eq!(Degradation::from_page(&page), expected);
        assert_eq!(Degradation::from_engine(&EngineErrorKind::Page(page)), expected);
    }

    #[test]
    fn test_degradation_without_fetch_failure() {
        let kind = EngineErrorKind::Query("file is not a database".into());
        assert_eq!(Degradation::from_engine(&kind), Degradation::Failed("query error: file is not a database".into()));
    }
}

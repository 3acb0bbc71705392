//! Range fetcher: retries, per-attempt timeouts, concurrency limit, speed
//! probe and integrity checks on top of a [`RangeSource`].

use crate::error::{ErrorKind, Result};
use crate::models::{FileVersion, SourceInfo};
use crate::progress::ProgressTracker;
use crate::retry::Backoff;
use crate::source::SourceHandle;
use crate::speed::{SpeedClass, SpeedThresholds};
use crate::tiers::TimeoutTiers;
use bytes::Bytes;
use exn::{Exn, ResultExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Maximum number of requests outstanding at once.
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub tiers: TimeoutTiers,
    /// Size of the one-off speed probe read.
    pub probe_bytes: u64,
    pub thresholds: SpeedThresholds,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 6,
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            tiers: TimeoutTiers::default(),
            probe_bytes: 16 * 1024,
            thresholds: SpeedThresholds::default(),
        }
    }
}

#[derive(Debug, Default)]
struct FetchStats {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time fetch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSnapshot {
    /// Attempts sent to the source, retries included.
    pub requests: u64,
    pub retries: u64,
    /// Requests that failed after exhausting (or not qualifying for) retries.
    pub failures: u64,
    pub bytes: u64,
}

/// Fetches byte ranges from a source with bounded retries.
///
/// The fetcher is pure with respect to `(offset, length, version)`: the same
/// arguments always yield the same bytes or an error, and apart from the
/// request itself the only side effects are counters and progress.
pub struct RangeFetcher {
    source: SourceHandle,
    config: FetchConfig,
    permits: Semaphore,
    speed: OnceCell<SpeedClass>,
    progress: Mutex<Option<Arc<ProgressTracker>>>,
    stats: FetchStats,
}

impl std::fmt::Debug for RangeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeFetcher")
            .field("source", &self.source.name())
            .field("config", &self.config)
            .field("speed", &self.speed.get())
            .finish_non_exhaustive()
    }
}

impl RangeFetcher {
    pub fn new(source: SourceHandle, config: FetchConfig) -> Self {
        let permits = Semaphore::new(config.concurrency.max(1));
        Self {
            source,
            config,
            permits,
            speed: OnceCell::new(),
            progress: Mutex::new(None),
            stats: FetchStats::default(),
        }
    }

    pub fn source(&self) -> &SourceHandle {
        &self.source
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Route byte counts of subsequent fetches to `tracker`.
    pub fn attach_progress(&self, tracker: Arc<ProgressTracker>) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(tracker);
    }

    pub fn detach_progress(&self) {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn record(&self, bytes: u64) {
        self.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
        if let Some(tracker) = self.progress.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            tracker.record(bytes);
        }
    }

    pub fn snapshot(&self) -> FetchSnapshot {
        FetchSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
        }
    }

    /// Speed class, if the probe has already run.
    pub fn measured_speed(&self) -> Option<SpeedClass> {
        self.speed.get().copied()
    }

    /// Time allowed for one attempt of a range request.
    ///
    /// Until the speed probe has run, the normal tier applies.
    pub fn attempt_timeout(&self) -> Duration {
        let speed = self.measured_speed().unwrap_or(SpeedClass::Slow);
        TimeoutTiers::per_attempt(self.config.tiers.chunked_budget(speed), self.config.max_retries)
    }

    /// Probe the source, retrying transient failures.
    #[instrument(level = "debug", skip(self), fields(source = self.source.name()))]
    pub async fn probe(&self) -> Result<SourceInfo> {
        let timeout = TimeoutTiers::per_attempt(self.config.tiers.fast, self.config.max_retries);
        self.with_retry(timeout, || self.source.probe()).await
    }

    /// Classify the connection, measuring it on first use.
    pub async fn speed_class(&self, info: &SourceInfo) -> SpeedClass {
        *self.speed.get_or_init(|| self.measure(info)).await
    }

    async fn measure(&self, info: &SourceInfo) -> SpeedClass {
        let length = self.config.probe_bytes.min(info.size);
        if length == 0 || !info.accepts_ranges {
            return SpeedClass::Slow;
        }
        let started = Instant::now();
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let read = tokio::time::timeout(self.config.tiers.fast, self.source.read_range(0, length, &info.version));
        let class = match read.await {
            Ok(Ok(bytes)) => {
                self.record(bytes.len() as u64);
                self.config.thresholds.classify(bytes.len() as u64, started.elapsed())
            },
            Ok(Err(err)) => {
                let kind: &ErrorKind = &err;
                warn!(error = %kind, "speed probe failed");
                SpeedClass::VerySlow
            },
            Err(_) => SpeedClass::VerySlow,
        };
        debug!(%class, elapsed_ms = started.elapsed().as_millis() as u64, "measured connection speed");
        class
    }

    /// Fetch exactly `length` bytes at `offset` of `version`.
    #[instrument(level = "debug", skip(self, version), fields(source = self.source.name()))]
    pub async fn fetch_range(&self, offset: u64, length: u64, version: &FileVersion) -> Result<Bytes> {
        let timeout = self.attempt_timeout();
        let bytes = self.with_retry(timeout, || self.source.read_range(offset, length, version)).await?;
        if bytes.len() as u64 != length {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            exn::bail!(ErrorKind::Integrity(format!("expected {length} bytes, received {}", bytes.len())));
        }
        self.record(length);
        Ok(bytes)
    }

    /// Download and verify the complete file.
    ///
    /// Each attempt may use an equal share of the emergency tier.
    #[instrument(level = "debug", skip(self, info), fields(source = self.source.name(), size = info.size))]
    pub async fn fetch_all(&self, info: &SourceInfo) -> Result<Bytes> {
        let timeout = TimeoutTiers::per_attempt(self.config.tiers.emergency, self.config.max_retries);
        let bytes = self.with_retry(timeout, || self.source.read_all(&info.version)).await?;
        if bytes.len() as u64 != info.size {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            exn::bail!(ErrorKind::Integrity(format!("expected {} bytes, received {}", info.size, bytes.len())));
        }
        if let Some(expected) = info.expected_hash() {
            let actual = blake3::hash(&bytes);
            if !actual.to_hex().eq_ignore_ascii_case(expected) {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                exn::bail!(ErrorKind::Integrity(format!("hash mismatch: expected {expected}, got {actual}")));
            }
        }
        self.record(bytes.len() as u64);
        Ok(bytes)
    }

    /// Run `attempt` until it succeeds, fails permanently, or retries run
    /// out. A permit is held for the duration of each attempt only, never
    /// while backing off.
    async fn with_retry<T, F, Fut>(&self, timeout: Duration, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = Backoff::new(self.config.max_retries, self.config.base_backoff);
        loop {
            let outcome = {
                let _permit = self.permits.acquire().await.or_raise(|| ErrorKind::Cancelled)?;
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(timeout, attempt()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Exn::from(ErrorKind::Timeout(timeout))),
                }
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
            match backoff.next_delay() {
                Some(delay) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    let kind: &ErrorKind = &err;
                    warn!(error = %kind, retry = backoff.retries(), delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                },
                None => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{Phase, progress_channel};
    use crate::source::{MockSource, RangeSource};
    use futures::StreamExt;

    fn quick_config() -> FetchConfig {
        FetchConfig { base_backoff: Duration::from_millis(1), ..FetchConfig::default() }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_fetch_range_returns_exact_bytes() {
        let source = Arc::new(MockSource::new(data(4096)));
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let info = fetcher.probe().await.unwrap();
        let bytes = fetcher.fetch_range(100, 50, &info.version).await.unwrap();
        assert_eq!(&bytes[..], &data(4096)[100..150]);
        assert_eq!(fetcher.snapshot().bytes, 50);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(MockSource::new(data(1024)).failing_each_request(2));
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let info = source.probe().await.unwrap();
        let bytes = fetcher.fetch_range(0, 10, &info.version).await.unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(source.requests_for(0, 10), 3);
        let snapshot = fetcher.snapshot();
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.failures, 0);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let source = Arc::new(MockSource::new(data(1024)).failing_each_request(10));
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let info = source.probe().await.unwrap();
        let err = fetcher.fetch_range(0, 10, &info.version).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::Network(_)));
        // One attempt plus three retries.
        assert_eq!(source.requests_for(0, 10), 4);
        assert_eq!(fetcher.snapshot().failures, 1);
    }

    #[tokio::test]
    async fn test_range_unsupported_is_not_retried() {
        let source = Arc::new(MockSource::new(data(1024)).without_range_support());
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let info = source.probe().await.unwrap();
        let err = fetcher.fetch_range(0, 10, &info.version).await.unwrap_err();
        assert_eq!(*err, ErrorKind::RangeUnsupported);
        assert_eq!(source.range_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempts_time_out() {
        let source = Arc::new(MockSource::new(data(1024)).with_latency(Duration::from_secs(5)));
        let config = FetchConfig {
            max_retries: 0,
            tiers: TimeoutTiers {
                fast: Duration::from_secs(1),
                normal: Duration::from_secs(1),
                emergency: Duration::from_secs(1),
            },
            ..quick_config()
        };
        let fetcher = RangeFetcher::new(source.clone(), config);
        let version = FileVersion::new(blake3::hash(&data(1024)).to_hex().to_string());
        let err = fetcher.fetch_range(0, 10, &version).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Timeout(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_speed_is_measured_once() {
        let source = Arc::new(MockSource::new(data(64 * 1024)));
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let info = fetcher.probe().await.unwrap();
        assert_eq!(fetcher.measured_speed(), None);
        assert_eq!(fetcher.speed_class(&info).await, SpeedClass::Fast);
        assert_eq!(fetcher.speed_class(&info).await, SpeedClass::Fast);
        assert_eq!(source.requests_for(0, 16 * 1024), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_selects_normal_tier() {
        let source = Arc::new(MockSource::new(data(64 * 1024)).with_latency(Duration::from_secs(2)));
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let info = fetcher.probe().await.unwrap();
        assert_eq!(fetcher.speed_class(&info).await, SpeedClass::VerySlow);
        assert_eq!(fetcher.attempt_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fetch_all_verifies_hash() {
        let source = Arc::new(MockSource::new(data(2048)).with_descriptor());
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let mut info = fetcher.probe().await.unwrap();
        assert_eq!(fetcher.fetch_all(&info).await.unwrap().len(), 2048);

        if let Some(descriptor) = info.descriptor.as_mut() {
            descriptor.hash = Some("00".repeat(32));
        }
        let err = fetcher.fetch_all(&info).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::Integrity(_)));
    }

    #[tokio::test]
    async fn test_progress_is_reported_while_attached() {
        let source = Arc::new(MockSource::new(data(4096)));
        let fetcher = RangeFetcher::new(source.clone(), quick_config());
        let info = fetcher.probe().await.unwrap();
        let (tracker, stream) = progress_channel(Duration::ZERO);
        let tracker = Arc::new(tracker);
        tracker.begin_phase(Phase::Critical, 300);
        fetcher.attach_progress(Arc::clone(&tracker));
        for offset in [0, 100, 200] {
            fetcher.fetch_range(offset, 100, &info.version).await.unwrap();
        }
        fetcher.detach_progress();
        drop(tracker);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.last().map(|event| event.bytes_received), Some(300));
    }
}

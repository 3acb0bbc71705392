//! In-memory range source for testing.

use crate::error::{ErrorKind, Result};
use crate::models::{Descriptor, FileVersion, SourceInfo};
use crate::source::RangeSource;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

/// Key used to track injected failures for full downloads.
const FULL_DOWNLOAD: (u64, u64) = (u64::MAX, u64::MAX);

struct Served {
    data: Bytes,
    version: FileVersion,
    descriptor: Option<Descriptor>,
}
impl Served {
    fn new(data: Bytes, with_descriptor: bool) -> Self {
        let hash = blake3::hash(&data).to_hex().to_string();
        let descriptor = with_descriptor.then(|| Descriptor {
            size: data.len() as u64,
            hash: Some(hash.clone()),
            page_size: None,
            concurrency: None,
        });
        Self { data, version: FileVersion::new(hash), descriptor }
    }
}

/// In-memory range source for testing.
///
/// The served bytes live behind a [`RwLock`] so that tests can swap the file
/// mid-session. Latency, range support and transient failures are all
/// adjustable, and every request is counted so tests can assert on exactly how
/// much "network" traffic an operation caused.
///
/// # Examples
///
/// ```ignore
/// use rangedb_fetch::{MockSource, RangeSource};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let source = MockSource::new(vec![7u8; 1024]).with_latency(Duration::from_millis(5));
/// let info = source.probe().await?;
/// let bytes = source.read_range(0, 16, &info.version).await?;
/// assert_eq!(bytes.len(), 16);
/// assert_eq!(source.range_requests(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MockSource {
    name: String,
    served: RwLock<Served>,
    latency_ms: AtomicU64,
    ranges: AtomicBool,
    ranges_down: AtomicBool,
    failures_per_request: AtomicU32,
    attempts: Mutex<HashMap<(u64, u64), u32>>,
    log: Mutex<Vec<(u64, u64)>>,
    probes: AtomicU64,
    range_requests: AtomicU64,
    full_downloads: AtomicU64,
}

impl MockSource {
    /// Serve `data`; its version is the BLAKE3 hash of the contents.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            name: "mock".to_string(),
            served: RwLock::new(Served::new(data.into(), false)),
            latency_ms: AtomicU64::new(0),
            ranges: AtomicBool::new(true),
            ranges_down: AtomicBool::new(false),
            failures_per_request: AtomicU32::new(0),
            attempts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            probes: AtomicU64::new(0),
            range_requests: AtomicU64::new(0),
            full_downloads: AtomicU64::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Publish a sidecar descriptor (size + hash) alongside the data.
    pub fn with_descriptor(mut self) -> Self {
        let served = self.served.get_mut();
        *served = Served::new(served.data.clone(), true);
        self
    }

    /// Delay every request (probe, range, full download) by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Behave like a server that ignores `Range` headers.
    pub fn without_range_support(self) -> Self {
        self.ranges.store(false, Ordering::SeqCst);
        self
    }

    /// Fail the first `times` attempts of every distinct request with a
    /// transient network error.
    pub fn failing_each_request(self, times: u32) -> Self {
        self.failures_per_request.store(times, Ordering::SeqCst);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail every range request with a network error from now on, however
    /// often it is retried. Probes and full downloads keep working.
    pub fn set_ranges_down(&self, down: bool) {
        self.ranges_down.store(down, Ordering::SeqCst);
    }

    /// Replace the served file, as if it was republished mid-session.
    pub async fn replace(&self, data: impl Into<Bytes>) -> FileVersion {
        let mut served = self.served.write().await;
        let with_descriptor = served.descriptor.is_some();
        *served = Served::new(data.into(), with_descriptor);
        served.version.clone()
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Range requests received, including failed attempts.
    pub fn range_requests(&self) -> u64 {
        self.range_requests.load(Ordering::SeqCst)
    }

    pub fn full_downloads(&self) -> u64 {
        self.full_downloads.load(Ordering::SeqCst)
    }

    /// Every `(offset, length)` requested so far, in arrival order.
    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        lock(&self.log).clone()
    }

    /// How many times this exact range has been requested.
    pub fn requests_for(&self, offset: u64, length: u64) -> usize {
        lock(&self.log).iter().filter(|range| **range == (offset, length)).count()
    }

    async fn delay(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn inject_failure(&self, key: (u64, u64)) -> Result<()> {
        let limit = self.failures_per_request.load(Ordering::SeqCst);
        let mut attempts = lock(&self.attempts);
        let seen = attempts.entry(key).or_insert(0);
        if *seen < limit {
            *seen += 1;
            exn::bail!(ErrorKind::Network(format!("injected failure {seen}/{limit}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RangeSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<SourceInfo> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let served = self.served.read().await;
        Ok(SourceInfo {
            size: served.data.len() as u64,
            version: served.version.clone(),
            accepts_ranges: self.ranges.load(Ordering::SeqCst),
            descriptor: served.descriptor.clone(),
        })
    }

    async fn read_range(&self, offset: u64, length: u64, version: &FileVersion) -> Result<Bytes> {
        self.range_requests.fetch_add(1, Ordering::SeqCst);
        lock(&self.log).push((offset, length));
        self.delay().await;
        if !self.ranges.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::RangeUnsupported);
        }
        if self.ranges_down.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Network("range requests are down".into()));
        }
        self.inject_failure((offset, length))?;
        let served = self.served.read().await;
        if served.version != *version {
            exn::bail!(ErrorKind::Integrity(format!("serving {}, asked for {version}", served.version)));
        }
        let end = offset.saturating_add(length);
        if end > served.data.len() as u64 {
            exn::bail!(ErrorKind::Integrity(format!("range {offset}..{end} is beyond the end of the file")));
        }
        Ok(served.data.slice(offset as usize..end as usize))
    }

    async fn read_all(&self, version: &FileVersion) -> Result<Bytes> {
        self.full_downloads.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.inject_failure(FULL_DOWNLOAD)?;
        let served = self.served.read().await;
        if served.version != *version {
            exn::bail!(ErrorKind::Integrity(format!("serving {}, asked for {version}", served.version)));
        }
        Ok(served.data.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

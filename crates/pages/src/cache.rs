use crate::error::{ErrorKind, Result};
use crate::lru::Lru;
use bytes::{Bytes, BytesMut};
use exn::{Exn, OptionExt};
use futures::{StreamExt, TryStreamExt, stream};
use rangedb_asyncutils::SingleFlight;
use rangedb_fetch::error::ErrorKind as FetchErrorKind;
use rangedb_fetch::{FileVersion, RangeFetcher};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, trace};

/// Identity of one page: its position and the file version it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub index: u64,
    pub version: FileVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCacheConfig {
    /// Fixed for the lifetime of a cache.
    pub page_size: u64,
    pub capacity_bytes: u64,
    /// Maximum number of page fetches one read may have outstanding.
    pub concurrency: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self { page_size: 64 * 1024, capacity_bytes: 32 * 1024 * 1024, concurrency: 6 }
    }
}

#[derive(Debug, Default)]
struct PageStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time page cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Misses that joined a fetch already in flight instead of starting one.
    pub coalesced: u64,
    pub evictions: u64,
    pub resident_pages: usize,
    pub resident_bytes: u64,
}
impl PageSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

struct Inner {
    fetcher: Arc<RangeFetcher>,
    file_size: u64,
    config: PageCacheConfig,
    lru: Mutex<Lru>,
    flights: SingleFlight<PageKey, std::result::Result<Bytes, FetchErrorKind>>,
    stats: PageStats,
}

impl Inner {
    fn lru(&self) -> MutexGuard<'_, Lru> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, key: PageKey, data: Bytes) {
        let evicted = self.lru().insert(key, data);
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            trace!(evicted, "evicted pages");
        }
    }
}

/// In-memory cache of fixed-size pages of one remote file.
///
/// Cloning is cheap; clones share the same pages.
///
/// Concurrent requests for the same page share one fetch. That fetch runs on
/// its own task and always lands in the cache, so a reader giving up halfway
/// never wastes (or cancels) work another reader is waiting for.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("file_size", &self.inner.file_size)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl PageCache {
    pub fn new(fetcher: Arc<RangeFetcher>, file_size: u64, config: PageCacheConfig) -> Self {
        let config = PageCacheConfig { page_size: config.page_size.max(1), ..config };
        Self {
            inner: Arc::new(Inner {
                fetcher,
                file_size,
                lru: Mutex::new(Lru::new(config.capacity_bytes)),
                config,
                flights: SingleFlight::new(),
                stats: PageStats::default(),
            }),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.inner.config.page_size
    }

    pub fn file_size(&self) -> u64 {
        self.inner.file_size
    }

    pub fn page_count(&self) -> u64 {
        self.inner.file_size.div_ceil(self.page_size())
    }

    /// Byte offset and length of page `index`; the last page may be short.
    pub fn page_span(&self, index: u64) -> Option<(u64, u64)> {
        let offset = index.checked_mul(self.page_size())?;
        if offset >= self.inner.file_size {
            return None;
        }
        Some((offset, self.page_size().min(self.inner.file_size - offset)))
    }

    pub fn contains(&self, index: u64, version: &FileVersion) -> bool {
        self.inner.lru().contains(&PageKey { index, version: version.clone() })
    }

    /// Start a pin set for one reader. Setting `cancelled` stops that reader
    /// from starting further fetches.
    pub fn lease(&self, cancelled: Arc<AtomicBool>) -> Lease {
        Lease { inner: Arc::clone(&self.inner), pinned: Mutex::new(HashSet::new()), cancelled }
    }

    pub async fn get_page(&self, index: u64, version: &FileVersion) -> Result<Bytes> {
        self.load(PageKey { index, version: version.clone() }, None).await
    }

    async fn load(&self, key: PageKey, lease: Option<&Lease>) -> Result<Bytes> {
        let (offset, length) = self.page_span(key.index).ok_or_raise(|| ErrorKind::OutOfBounds(key.index))?;
        let cached = self.inner.lru().get(&key);
        if let Some(data) = cached {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            if let Some(lease) = lease {
                lease.pin(&key);
            }
            return Ok(data);
        }
        if lease.is_some_and(Lease::is_cancelled) {
            exn::bail!(ErrorKind::Cancelled);
        }
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(index = key.index, offset, length, "page miss");

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        // The token is ignored on purpose: a fetched page is always worth keeping.
        let outcome = self
            .inner
            .flights
            .run(key.clone(), move |_| async move {
                // Another flight for this page may have finished between the
                // cache check and this one starting.
                if let Some(data) = inner.lru().get(&task_key) {
                    return Ok(data);
                }
                match inner.fetcher.fetch_range(offset, length, &task_key.version).await {
                    Ok(data) => {
                        inner.store(task_key, data.clone());
                        Ok(data)
                    },
                    Err(err) => Err((*err).clone()),
                }
            })
            .await;
        let data = match outcome {
            Ok(Ok(data)) => data,
            Ok(Err(kind)) => exn::bail!(ErrorKind::Fetch(kind)),
            Err(abandoned) => return Err(Exn::from(abandoned).raise(ErrorKind::Abandoned)),
        };
        if let Some(lease) = lease {
            lease.pin(&key);
        }
        Ok(data)
    }

    /// Read `length` bytes at `offset`, fetching missing pages in parallel.
    ///
    /// Reads are clamped to the end of the file, so the result is shorter
    /// than `length` when it runs past it.
    pub async fn read(&self, offset: u64, length: usize, version: &FileVersion, lease: Option<&Lease>) -> Result<Bytes> {
        let end = offset.saturating_add(length as u64).min(self.inner.file_size);
        if offset >= end {
            return Ok(Bytes::new());
        }
        let page_size = self.page_size();
        let first = offset / page_size;
        let last = (end - 1) / page_size;
        let key = |index| PageKey { index, version: version.clone() };

        if first == last {
            let page = self.load(key(first), lease).await?;
            let start = (offset - first * page_size) as usize;
            return Ok(page.slice(start..start + (end - offset) as usize));
        }

        let pages: Vec<Bytes> = stream::iter(first..=last)
            .map(|index| self.load(key(index), lease))
            .buffered(self.inner.config.concurrency.max(1))
            .try_collect()
            .await?;
        let mut out = BytesMut::with_capacity((end - offset) as usize);
        for (index, page) in (first..=last).zip(&pages) {
            let page_start = index * page_size;
            let from = offset.saturating_sub(page_start) as usize;
            let to = ((end - page_start) as usize).min(page.len());
            out.extend_from_slice(&page[from..to]);
        }
        Ok(out.freeze())
    }

    /// Fetch every page overlapping `range` that is not cached yet.
    ///
    /// Returns the number of pages fetched.
    #[instrument(level = "debug", skip(self, version))]
    pub async fn prefetch(&self, range: Range<u64>, version: &FileVersion) -> Result<usize> {
        let end = range.end.min(self.inner.file_size);
        if range.start >= end {
            return Ok(0);
        }
        let page_size = self.page_size();
        let missing: Vec<u64> =
            (range.start / page_size..=(end - 1) / page_size).filter(|index| !self.contains(*index, version)).collect();
        let fetched = missing.len();
        stream::iter(missing)
            .map(|index| self.get_page(index, version))
            .buffer_unordered(self.inner.config.concurrency.max(1))
            .try_for_each(|_| futures::future::ready(Ok(())))
            .await?;
        Ok(fetched)
    }

    /// Seed the cache from a complete copy of the file, stopping once the
    /// cache is full. Returns the number of pages stored.
    pub fn populate(&self, data: &Bytes, version: &FileVersion) -> usize {
        if data.len() as u64 != self.inner.file_size {
            return 0;
        }
        let mut stored = 0;
        for index in 0..self.page_count() {
            let Some((offset, length)) = self.page_span(index) else {
                break;
            };
            let key = PageKey { index, version: version.clone() };
            let mut lru = self.inner.lru();
            if lru.contains(&key) {
                continue;
            }
            if !lru.has_room_for(length) {
                break;
            }
            lru.insert(key, data.slice(offset as usize..(offset + length) as usize));
            stored += 1;
        }
        stored
    }

    pub fn snapshot(&self) -> PageSnapshot {
        let lru = self.inner.lru();
        PageSnapshot {
            hits: self.inner.stats.hits.load(Ordering::Relaxed),
            misses: self.inner.stats.misses.load(Ordering::Relaxed),
            coalesced: self.inner.flights.snapshot().followers,
            evictions: self.inner.stats.evictions.load(Ordering::Relaxed),
            resident_pages: lru.len(),
            resident_bytes: lru.bytes(),
        }
    }
}

/// Pages pinned on behalf of one reader.
///
/// Pinned pages are never evicted. Dropping the lease releases every pin.
pub struct Lease {
    inner: Arc<Inner>,
    pinned: Mutex<HashSet<PageKey>>,
    cancelled: Arc<AtomicBool>,
}

impl Lease {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn pinned(&self) -> usize {
        self.pinned.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn pin(&self, key: &PageKey) {
        let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);
        if !pinned.contains(key) && self.inner.lru().pin(key) {
            pinned.insert(key.clone());
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let pinned = std::mem::take(self.pinned.get_mut().unwrap_or_else(PoisonError::into_inner));
        if pinned.is_empty() {
            return;
        }
        let mut lru = self.inner.lru();
        for key in &pinned {
            lru.unpin(key);
        }
        let evicted = lru.evict();
        self.inner.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangedb_fetch::{FetchConfig, MockSource, RangeSource};
    use rstest::rstest;
    use std::time::Duration;

    const PAGE: u64 = 1024;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    async fn cache_over(source: MockSource, capacity_pages: u64) -> (Arc<MockSource>, PageCache, FileVersion) {
        let source = Arc::new(source);
        let info = source.probe().await.unwrap();
        let config = FetchConfig { base_backoff: Duration::from_millis(1), ..FetchConfig::default() };
        let fetcher = Arc::new(RangeFetcher::new(source.clone(), config));
        let pages = PageCacheConfig { page_size: PAGE, capacity_bytes: capacity_pages * PAGE, concurrency: 6 };
        (source, PageCache::new(fetcher, info.size, pages), info.version)
    }

    #[rstest]
    #[case(0, Some((0, 1024)))]
    #[case(1, Some((1024, 1024)))]
    #[case(2, Some((2048, 452)))]
    #[case(3, None)]
    #[case(u64::MAX, None)]
    fn test_page_span(#[case] index: u64, #[case] expected: Option<(u64, u64)>) {
        let fetcher = Arc::new(RangeFetcher::new(Arc::new(MockSource::new(data(2500))), FetchConfig::default()));
        let cache = PageCache::new(fetcher, 2500, PageCacheConfig { page_size: PAGE, ..PageCacheConfig::default() });
        assert_eq!(cache.page_span(index), expected);
    }

    #[tokio::test]
    async fn test_get_page_and_short_edge_page() {
        let (_, cache, version) = cache_over(MockSource::new(data(2500)), 8).await;
        assert_eq!(cache.page_count(), 3);
        assert_eq!(&cache.get_page(1, &version).await.unwrap()[..], &data(2500)[1024..2048]);
        assert_eq!(cache.get_page(2, &version).await.unwrap().len(), 452);
        let err = cache.get_page(3, &version).await.unwrap_err();
        assert_eq!(*err, ErrorKind::OutOfBounds(3));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let source = MockSource::new(data(8 * 1024)).with_latency(Duration::from_millis(50));
        let (source, cache, version) = cache_over(source, 8).await;

        let readers = (0..16).map(|_| cache.get_page(3, &version));
        let pages = futures::future::try_join_all(readers).await.unwrap();

        assert!(pages.iter().all(|page| page == &pages[0]));
        assert_eq!(source.requests_for(3 * PAGE, PAGE), 1);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.misses, 16);
        assert_eq!(snapshot.coalesced, 15);
    }

    #[tokio::test]
    async fn test_cached_page_needs_no_request() {
        let (source, cache, version) = cache_over(MockSource::new(data(4096)), 8).await;
        cache.get_page(0, &version).await.unwrap();
        let before = source.range_requests();
        cache.get_page(0, &version).await.unwrap();
        assert_eq!(source.range_requests(), before);
        assert_eq!(cache.snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_versions_do_not_share_pages() {
        let (source, cache, version) = cache_over(MockSource::new(data(4096)), 8).await;
        cache.get_page(0, &version).await.unwrap();
        let err = cache.get_page(0, &FileVersion::new("other")).await.unwrap_err();
        assert!(matches!(err.fetch_kind(), Some(FetchErrorKind::Integrity(_))));
        assert_eq!(source.requests_for(0, PAGE), 2);
    }

    #[tokio::test]
    async fn test_read_spans_pages() {
        let (_, cache, version) = cache_over(MockSource::new(data(5000)), 8).await;
        let bytes = cache.read(1000, 2100, &version, None).await.unwrap();
        assert_eq!(&bytes[..], &data(5000)[1000..3100]);
        // Clamped at end of file.
        let tail = cache.read(4990, 100, &version, None).await.unwrap();
        assert_eq!(tail.len(), 10);
        assert!(cache.read(6000, 10, &version, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_pins_until_dropped() {
        let (_, cache, version) = cache_over(MockSource::new(data(8 * 1024)), 2).await;
        let lease = cache.lease(Arc::new(AtomicBool::new(false)));
        cache.read(0, 10, &version, Some(&lease)).await.unwrap();
        assert_eq!(lease.pinned(), 1);

        for index in 1..6 {
            cache.get_page(index, &version).await.unwrap();
        }
        assert!(cache.contains(0, &version), "pinned page was evicted");

        drop(lease);
        cache.get_page(6, &version).await.unwrap();
        assert!(!cache.contains(0, &version));
    }

    #[tokio::test]
    async fn test_cancelled_lease_stops_new_fetches() {
        let (source, cache, version) = cache_over(MockSource::new(data(8 * 1024)), 8).await;
        cache.get_page(0, &version).await.unwrap();
        let cancelled = Arc::new(AtomicBool::new(true));
        let lease = cache.lease(cancelled);
        let before = source.range_requests();

        // Cached pages are still served.
        assert!(cache.read(0, 100, &version, Some(&lease)).await.is_ok());
        let err = cache.read(0, 4096, &version, Some(&lease)).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Cancelled);
        assert_eq!(source.range_requests(), before);
    }

    #[tokio::test]
    async fn test_abandoned_reader_does_not_cancel_fetch() {
        let source = MockSource::new(data(4096)).with_latency(Duration::from_millis(50));
        let (source, cache, version) = cache_over(source, 8).await;
        let reader = {
            let cache = cache.clone();
            let version = version.clone();
            tokio::spawn(async move { cache.get_page(2, &version).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.contains(2, &version));
        assert_eq!(source.requests_for(2 * PAGE, PAGE), 1);
    }

    #[tokio::test]
    async fn test_prefetch_skips_cached_pages() {
        let (source, cache, version) = cache_over(MockSource::new(data(10 * 1024)), 16).await;
        cache.get_page(1, &version).await.unwrap();
        assert_eq!(cache.prefetch(0..4 * PAGE, &version).await.unwrap(), 3);
        assert_eq!(cache.prefetch(0..4 * PAGE, &version).await.unwrap(), 0);
        assert_eq!(source.range_requests(), 4);
    }

    #[tokio::test]
    async fn test_populate_respects_capacity() {
        let (source, cache, version) = cache_over(MockSource::new(data(10 * 1024)), 4).await;
        let all = Bytes::from(data(10 * 1024));
        assert_eq!(cache.populate(&all, &version), 4);
        assert_eq!(&cache.get_page(3, &version).await.unwrap()[..], &all[3072..4096]);
        assert_eq!(source.range_requests(), 0);
    }
}

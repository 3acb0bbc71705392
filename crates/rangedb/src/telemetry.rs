use rangedb_cache::CacheSnapshot;
use rangedb_engine::EngineSnapshot;
use rangedb_fetch::FetchSnapshot;
use rangedb_pages::PageSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct QueryStats {
    queries: AtomicU64,
    failures: AtomicU64,
    busy_micros: AtomicU64,
}

impl QueryStats {
    pub(crate) fn record(&self, elapsed: Duration, failed: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.busy_micros.fetch_add(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Counters for an external monitoring layer.
///
/// Fetch, page and engine counters cover the current file session and start
/// over after [`reset`](crate::DatabaseHandle::reset); query and result cache
/// counters cover the lifetime of the handle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySnapshot {
    /// Queries answered through the handle, cache hits included.
    pub queries: u64,
    pub failed_queries: u64,
    pub average_query_latency: Option<Duration>,
    pub page_hit_ratio: f64,
    pub result_hit_ratio: f64,
    pub retries: u64,
    pub bytes_fetched: u64,
    /// Page and result lookups that waited on work already in flight.
    pub coalesced_waits: u64,
    pub fetch: FetchSnapshot,
    pub pages: Option<PageSnapshot>,
    pub results: CacheSnapshot,
    pub engine: Option<EngineSnapshot>,
}

impl TelemetrySnapshot {
    pub(crate) fn new(
        queries: &QueryStats,
        fetch: FetchSnapshot,
        pages: Option<PageSnapshot>,
        results: CacheSnapshot,
        engine: Option<EngineSnapshot>,
    ) -> Self {
        let count = queries.queries.load(Ordering::Relaxed);
        let busy = Duration::from_micros(queries.busy_micros.load(Ordering::Relaxed));
        let average_query_latency = u32::try_from(count).ok().filter(|count| *count > 0).map(|count| busy / count);
        Self {
            queries: count,
            failed_queries: queries.failures.load(Ordering::Relaxed),
            average_query_latency,
            page_hit_ratio: pages.map_or(0.0, |pages| pages.hit_ratio()),
            result_hit_ratio: results.hit_ratio(),
            retries: fetch.retries,
            bytes_fetched: fetch.bytes,
            coalesced_waits: pages.map_or(0, |pages| pages.coalesced) + results.coalesced,
            fetch,
            pages,
            results,
            engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_counters() {
        let stats = QueryStats::default();
        stats.record(Duration::from_millis(30), false);
        stats.record(Duration::from_millis(10), true);
        let pages = PageSnapshot { hits: 3, misses: 1, coalesced: 2, ..PageSnapshot::default() };
        let results = CacheSnapshot { memory_hits: 1, misses: 1, coalesced: 1, ..CacheSnapshot::default() };
        let fetch = FetchSnapshot { retries: 4, bytes: 4096, ..FetchSnapshot::default() };

        let telemetry = TelemetrySnapshot::new(&stats, fetch, Some(pages), results, None);
        assert_eq!((telemetry.queries, telemetry.failed_queries), (2, 1));
        assert_eq!(telemetry.average_query_latency, Some(Duration::from_millis(20)));
        assert_eq!(telemetry.page_hit_ratio, 0.75);
        assert_eq!(telemetry.result_hit_ratio, 0.5);
        assert_eq!((telemetry.retries, telemetry.bytes_fetched, telemetry.coalesced_waits), (4, 4096, 3));
    }

    #[test]
    fn test_empty() {
        let telemetry = TelemetrySnapshot::new(
            &QueryStats::default(),
            FetchSnapshot::default(),
            None,
            CacheSnapshot::default(),
            None,
        );
        assert_eq!(telemetry.average_query_latency, None);
        assert_eq!(telemetry.page_hit_ratio, 0.0);
    }
}

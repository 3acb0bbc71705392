//! Per-key request coalescing.
//!
//! The first caller for a key becomes the leader: its work is spawned onto the
//! runtime and every concurrent caller for the same key awaits that same
//! spawned task. Because the work runs detached from any single caller,
//! dropping the leader's future does not cancel the work for followers.
//!
//! Each flight carries a [`CancellationToken`] that is cancelled only once
//! *every* waiter has gone away, so work nobody is waiting for any more can
//! stop early while shared work always runs to completion.

use derive_more::{Display, Error};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// The task driving a flight went away without producing a value (it
/// panicked, or the runtime is shutting down).
#[derive(Debug, Clone, Copy, Display, Error, PartialEq, Eq)]
#[display("in-flight work was abandoned before completing")]
pub struct Abandoned;

type SharedOutput<V> = Shared<BoxFuture<'static, Result<V, Abandoned>>>;
type FlightMap<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

struct Flight<V> {
    id: u64,
    output: SharedOutput<V>,
    waiters: Arc<AtomicUsize>,
    token: CancellationToken,
}

/// Decrements the waiter count of a flight when a caller stops waiting.
struct WaiterGuard {
    waiters: Arc<AtomicUsize>,
    token: CancellationToken,
}
impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.token.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct FlightStats {
    leaders: AtomicU64,
    followers: AtomicU64,
}

/// Point-in-time coalescing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlightSnapshot {
    /// Requests that started new work.
    pub leaders: u64,
    /// Requests that joined work already in flight.
    pub followers: u64,
}
impl FlightSnapshot {
    /// Fraction of requests that were served by joining existing work.
    pub fn coalescing_ratio(&self) -> f64 {
        let total = self.leaders + self.followers;
        if total == 0 { 0.0 } else { self.followers as f64 / total as f64 }
    }
}

/// Coalesces concurrent work by key.
///
/// ```
/// use rangedb_asyncutils::SingleFlight;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let flights: SingleFlight<u64, String> = SingleFlight::new();
/// let value = flights.run(7, |_token| async { "page seven".to_string() }).await;
/// assert_eq!(value.as_deref(), Ok("page seven"));
/// # }
/// ```
pub struct SingleFlight<K, V> {
    flights: FlightMap<K, V>,
    next_id: AtomicU64,
    stats: FlightStats,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            stats: FlightStats::default(),
        }
    }
}

impl<K, V> fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &lock(&self.flights).len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make` for `key` unless identical work is already in flight, in
    /// which case wait for that instead.
    ///
    /// `make` receives a token that is cancelled once no caller is waiting for
    /// the result any more. Work that should always finish (for example
    /// because it fills a cache) can simply ignore it.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V, Abandoned>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (output, guard) = self.join_or_start(key, make);
        let result = output.await;
        drop(guard);
        result
    }

    fn join_or_start<F, Fut>(&self, key: K, make: F) -> (SharedOutput<V>, WaiterGuard)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut flights = lock(&self.flights);
        // A flight whose waiters all left is winding down; start afresh rather
        // than hand a new caller the result of abandoned work.
        if let Some(flight) = flights.get(&key)
            && !flight.token.is_cancelled()
        {
            flight.waiters.fetch_add(1, Ordering::AcqRel);
            self.stats.followers.fetch_add(1, Ordering::Relaxed);
            let guard = WaiterGuard { waiters: Arc::clone(&flight.waiters), token: flight.token.clone() };
            return (flight.output.clone(), guard);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let waiters = Arc::new(AtomicUsize::new(1));
        let work = make(token.clone());
        let registry = Arc::clone(&self.flights);
        let task_key = key.clone();
        // The map lock is held until the flight is inserted below, so the task
        // cannot deregister itself before it has been registered.
        let handle = tokio::spawn(async move {
            let value = work.await;
            let mut flights = lock(&registry);
            if flights.get(&task_key).is_some_and(|flight| flight.id == id) {
                flights.remove(&task_key);
            }
            value
        });
        let output = handle.map(|joined| joined.map_err(|_| Abandoned)).boxed().shared();
        flights.insert(
            key,
            Flight { id, output: output.clone(), waiters: Arc::clone(&waiters), token: token.clone() },
        );
        self.stats.leaders.fetch_add(1, Ordering::Relaxed);
        trace!(flight = id, "started new flight");
        (output, WaiterGuard { waiters, token })
    }

    /// Number of keys with work currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }

    pub fn snapshot(&self) -> FlightSnapshot {
        FlightSnapshot {
            leaders: self.stats.leaders.load(Ordering::Relaxed),
            followers: self.stats.followers.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Throttled progress reporting.
//!
//! A loader run creates one [`ProgressTracker`]/[`ProgressStream`] pair with
//! [`progress_channel`]. The tracker is fed byte counts as fetches complete and
//! turns them into [`ProgressEvent`] snapshots, at most one per interval plus
//! one at every phase change and one when the run finishes. The stream ends
//! once the tracker (and every clone of it) has been dropped, so each run's
//! subscription is finite.

use async_stream::stream;
use futures::Stream;
use rangedb_asyncutils::Throttle;
use std::fmt;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::Instant;

/// Stage of the loading pipeline an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Source probe and connection speed measurement.
    Probe,
    /// Prefix required before the first query can run.
    Critical,
    /// Larger prefix fetched in the background.
    Important,
    /// Whole-file download after chunked loading was abandoned.
    FullDownload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Probe => "probe",
            Self::Critical => "critical",
            Self::Important => "important",
            Self::FullDownload => "full download",
        })
    }
}

/// Immutable snapshot of loading progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub bytes_received: u64,
    pub total_bytes: u64,
    /// Bytes per second since the previous event.
    pub speed: f64,
    pub eta: Option<Duration>,
}

impl ProgressEvent {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_received as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

struct TrackerState {
    phase: Phase,
    received: u64,
    total: u64,
    throttle: Throttle,
    window_start: Instant,
    window_bytes: u64,
    speed: f64,
}

impl TrackerState {
    fn snapshot(&self) -> ProgressEvent {
        let remaining = self.total.saturating_sub(self.received);
        let eta = match remaining {
            0 => Some(Duration::ZERO),
            _ if self.speed > 0.0 => Some(Duration::from_secs_f64(remaining as f64 / self.speed)),
            _ => None,
        };
        ProgressEvent {
            phase: self.phase,
            bytes_received: self.received,
            total_bytes: self.total,
            speed: self.speed,
            eta,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        if elapsed > 0.0 {
            self.speed = self.window_bytes as f64 / elapsed;
        }
        self.window_start = now;
        self.window_bytes = 0;
    }
}

/// Producer side of a progress subscription.
pub struct ProgressTracker {
    tx: UnboundedSender<ProgressEvent>,
    state: Mutex<TrackerState>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker").field("closed", &self.tx.is_closed()).finish()
    }
}

impl ProgressTracker {
    /// Start a new phase and emit its first event immediately.
    pub fn begin_phase(&self, phase: Phase, total_bytes: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        state.phase = phase;
        state.received = 0;
        state.total = total_bytes;
        state.window_start = now;
        state.window_bytes = 0;
        state.throttle.reset();
        state.throttle.ready_at(now);
        self.emit(state.snapshot());
    }

    /// Account for `bytes` that just arrived.
    pub fn record(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.received = state.received.saturating_add(bytes);
        state.window_bytes = state.window_bytes.saturating_add(bytes);
        let now = Instant::now();
        if state.throttle.ready_at(now) {
            state.roll_window(now);
            self.emit(state.snapshot());
        }
    }

    /// Emit the final, unthrottled event of the current phase.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll_window(Instant::now());
        state.received = state.received.max(state.total);
        self.emit(state.snapshot());
    }

    fn emit(&self, event: ProgressEvent) {
        // Nobody listening is fine; progress is advisory.
        _ = self.tx.send(event);
    }
}

/// Consumer side of a progress subscription.
pub struct ProgressStream {
    inner: Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>,
}

impl ProgressStream {
    fn new(mut rx: UnboundedReceiver<ProgressEvent>) -> Self {
        let inner = stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        };
        Self { inner: Box::pin(inner) }
    }
}

impl fmt::Debug for ProgressStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressStream").finish_non_exhaustive()
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Create a tracker/stream pair emitting at most one throttled event per
/// `interval`.
pub fn progress_channel(interval: Duration) -> (ProgressTracker, ProgressStream) {
    let (tx, rx) = unbounded_channel();
    let now = Instant::now();
    let state = TrackerState {
        phase: Phase::Probe,
        received: 0,
        total: 0,
        throttle: Throttle::new(interval),
        window_start: now,
        window_bytes: 0,
        speed: 0.0,
    };
    (ProgressTracker { tx, state: Mutex::new(state) }, ProgressStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_events_are_throttled() {
        let (tracker, stream) = progress_channel(Duration::from_millis(200));
        tracker.begin_phase(Phase::Critical, 1000);
        for _ in 0..5 {
            tracker.record(10);
        }
        tokio::time::advance(Duration::from_millis(200)).await;
        tracker.record(50);
        tracker.finish();
        drop(tracker);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 3, "phase start, one throttled update, final: {events:?}");
        assert_eq!(events[0].bytes_received, 0);
        assert_eq!(events[1].bytes_received, 100);
        assert!((events[1].speed - 500.0).abs() < 1.0);
        assert_eq!(events[2].percent(), 100.0);
        assert_eq!(events[2].eta, Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_change_emits_immediately() {
        let (tracker, stream) = progress_channel(Duration::from_secs(10));
        tracker.begin_phase(Phase::Critical, 10);
        tracker.begin_phase(Phase::Important, 20);
        drop(tracker);

        let phases: Vec<_> = stream.map(|event| event.phase).collect().await;
        assert_eq!(phases, [Phase::Critical, Phase::Important]);
    }

    #[test]
    fn test_percent_of_empty_total() {
        let event = ProgressEvent { phase: Phase::Probe, bytes_received: 0, total_bytes: 0, speed: 0.0, eta: None };
        assert_eq!(event.percent(), 100.0);
    }
}

//! Fallback/timeout state machine.
//!
//! ```text
//! Init ──▶ ChunkedLoading ──────────▶ Ready(Chunked) ───┐
//!              │      │                    │            │
//!              │      ▼                    │            │
//!              │  DegradedFullDownload ◀───┘            │
//!              │      │         │                       │
//!              │      │         ▼                       │
//!              │      │   Ready(FullDownload) ───┐      │
//!              │      ▼                          ▼      ▼
//!              └────────────────────────────▶ Failed
//! ```
//!
//! `Ready(Chunked)` degrades when page fetches run out of retries after
//! loading. Either ready state fails if the file changes under it. Every
//! state may go back to `Init` (retry, reset). Anything else is rejected
//! and logged.

use derive_more::Display;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// How the database ended up being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Strategy {
    /// Pages fetched on demand with range requests.
    #[display("chunked")]
    Chunked,
    /// The whole file was downloaded.
    #[display("full download")]
    FullDownload,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ControllerState {
    #[display("init")]
    Init,
    #[display("chunked loading")]
    ChunkedLoading,
    #[display("ready ({_0})")]
    Ready(Strategy),
    /// Chunked loading was abandoned and the whole file is being downloaded.
    #[display("degraded to full download ({reason})")]
    DegradedFullDownload { reason: String },
    /// Nothing worked; `message` is suitable for end users.
    #[display("failed ({message})")]
    Failed { message: String },
}

impl ControllerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Whether the loader has stopped working, successfully or not.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failed { .. })
    }

    pub fn can_transition_to(&self, next: &ControllerState) -> bool {
        use ControllerState::*;
        match (self, next) {
            (Init, Init) => false,
            (_, Init) => true,
            (Init, ChunkedLoading) => true,
            (ChunkedLoading, Ready(Strategy::Chunked) | DegradedFullDownload { .. } | Failed { .. }) => true,
            (DegradedFullDownload { .. }, Ready(Strategy::FullDownload) | Failed { .. }) => true,
            (Ready(Strategy::Chunked), DegradedFullDownload { .. }) => true,
            (Ready(_), Failed { .. }) => true,
            _ => false,
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ControllerState,
    pub to: ControllerState,
    /// Time since the handle was opened.
    pub at: Duration,
}

pub(crate) struct Controller {
    state: watch::Sender<ControllerState>,
    history: Mutex<Vec<Transition>>,
    created: Instant,
}

impl Controller {
    pub(crate) fn new() -> Self {
        Self {
            state: watch::Sender::new(ControllerState::Init),
            history: Mutex::new(Vec::new()),
            created: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> ControllerState {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    pub(crate) fn history(&self) -> Vec<Transition> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Move to `next`, returning `false` if that is not a legal transition
    /// from the current state.
    pub(crate) fn transition(&self, next: ControllerState) -> bool {
        let mut rejected = None;
        let accepted = self.state.send_if_modified(|state| {
            if !state.can_transition_to(&next) {
                rejected = Some(state.clone());
                return false;
            }
            let from = std::mem::replace(state, next.clone());
            info!(%from, to = %next, "controller transition");
            let transition = Transition { from, to: next.clone(), at: self.created.elapsed() };
            self.history.lock().unwrap_or_else(PoisonError::into_inner).push(transition);
            true
        });
        if let Some(current) = rejected {
            warn!(from = %current, to = %next, "ignoring illegal controller transition");
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn degraded() -> ControllerState {
        ControllerState::DegradedFullDownload { reason: "slow".into() }
    }

    fn failed() -> ControllerState {
        ControllerState::Failed { message: "offline".into() }
    }

    #[rstest]
    #[case(ControllerState::Init, ControllerState::ChunkedLoading, true)]
    #[case(ControllerState::ChunkedLoading, ControllerState::Ready(Strategy::Chunked), true)]
    #[case(ControllerState::ChunkedLoading, degraded(), true)]
    #[case(ControllerState::ChunkedLoading, failed(), true)]
    #[case(degraded(), ControllerState::Ready(Strategy::FullDownload), true)]
    #[case(degraded(), failed(), true)]
    #[case(failed(), ControllerState::Init, true)]
    #[case(ControllerState::Ready(Strategy::Chunked), ControllerState::Init, true)]
    #[case(ControllerState::Init, ControllerState::Init, false)]
    #[case(ControllerState::Init, ControllerState::Ready(Strategy::Chunked), false)]
    #[case(ControllerState::ChunkedLoading, ControllerState::Ready(Strategy::FullDownload), false)]
    #[case(degraded(), ControllerState::Ready(Strategy::Chunked), false)]
    #[case(degraded(), ControllerState::ChunkedLoading, false)]
    #[case(failed(), ControllerState::Ready(Strategy::Chunked), false)]
    #[case(ControllerState::Ready(Strategy::Chunked), degraded(), true)]
    #[case(ControllerState::Ready(Strategy::Chunked), failed(), true)]
    #[case(ControllerState::Ready(Strategy::FullDownload), failed(), true)]
    #[case(ControllerState::Ready(Strategy::FullDownload), degraded(), false)]
    #[case(ControllerState::Ready(Strategy::Chunked), ControllerState::ChunkedLoading, false)]
    fn test_transitions(#[case] from: ControllerState, #[case] to: ControllerState, #[case] legal: bool) {
        assert_eq!(from.can_transition_to(&to), legal);
    }

    #[tokio::test]
    async fn test_history_and_subscribers() {
        let controller = Controller::new();
        let mut states = controller.subscribe();
        assert!(controller.transition(ControllerState::ChunkedLoading));
        assert!(controller.transition(degraded()));
        assert!(!controller.transition(ControllerState::Ready(Strategy::Chunked)));
        assert!(controller.transition(ControllerState::Ready(Strategy::FullDownload)));

        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ControllerState::Ready(Strategy::FullDownload));
        let history = controller.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].from, ControllerState::Init);
        assert_eq!(history[1].to, degraded());
        assert!(history.windows(2).all(|pair| pair[0].at <= pair[1].at && pair[0].to == pair[1].from));
    }

    #[test]
    fn test_display() {
        assert_eq!(ControllerState::Ready(Strategy::FullDownload).to_string(), "ready (full download)");
        assert_eq!(failed().to_string(), "failed (offline)");
    }
}

//! Single-flight coordination of access-token refreshes.
//!
//! Requests that fail with an expired token are parked in a FIFO queue, and
//! callers that only want a fresh session subscribe as listeners. The first
//! arrival while no refresh is running starts one; everyone else waits for
//! it. When the refresh settles, the queue and the listeners are taken and
//! the flag is cleared in one step, so the flag is only ever set while a
//! refresh call is outstanding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;

use crate::auth::Session;
use crate::error::{Error, Result};
use crate::pipeline::request::{ApiRequest, ApiResponse};

/// What a refresh resolves to. The error is shared by every waiter.
pub(crate) type RefreshOutcome = std::result::Result<Session, Arc<Error>>;

/// A request waiting for the running refresh.
pub(crate) struct PendingRequest {
    pub(crate) request: ApiRequest,
    pub(crate) reply: oneshot::Sender<Result<ApiResponse>>,
}

/// Everything that was waiting when a refresh settled, in arrival order.
#[derive(Default)]
pub(crate) struct Settled {
    pub(crate) requests: Vec<PendingRequest>,
    pub(crate) listeners: Vec<oneshot::Sender<RefreshOutcome>>,
}

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    queue: VecDeque<PendingRequest>,
    listeners: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// Refresh flag plus the requests and listeners parked behind it.
#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    refreshes: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a refresh call is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.state().in_progress
    }

    /// Number of requests parked behind the running refresh.
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Number of refreshes started so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Park a request. Returns true when the caller has to start the refresh.
    pub(crate) fn enqueue(&self, pending: PendingRequest) -> bool {
        let mut state = self.state();
        state.queue.push_back(pending);
        debug!(queued = state.queue.len(), "Request parked behind refresh");
        self.claim(&mut state)
    }

    /// Wait for the running refresh, or the next one. Returns true when the
    /// caller has to start it.
    pub(crate) fn subscribe(&self, listener: oneshot::Sender<RefreshOutcome>) -> bool {
        let mut state = self.state();
        state.listeners.push(listener);
        self.claim(&mut state)
    }

    fn claim(&self, state: &mut RefreshState) -> bool {
        if state.in_progress {
            return false;
        }
        state.in_progress = true;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take every waiter and clear the flag. Anything arriving afterwards
    /// starts a new refresh.
    pub(crate) fn settle(&self) -> Settled {
        let mut state = self.state();
        state.in_progress = false;
        Settled {
            requests: state.queue.drain(..).collect(),
            listeners: std::mem::take(&mut state.listeners),
        }
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("RefreshCoordinator")
            .field("in_progress", &state.in_progress)
            .field("queued", &state.queue.len())
            .field("listeners", &state.listeners.len())
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

/// Held by the task driving a refresh.
///
/// Dropped while armed (the task was aborted or panicked), it rejects every
/// parked request with [`Error::Cancelled`], drops the listeners and clears
/// the flag.
pub(crate) struct RefreshGuard {
    coordinator: Arc<RefreshCoordinator>,
    armed: bool,
}

impl RefreshGuard {
    pub(crate) fn new(coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            coordinator,
            armed: true,
        }
    }

    /// Settle the coordinator and hand the waiters to the driver.
    pub(crate) fn settle(mut self) -> Settled {
        self.armed = false;
        self.coordinator.settle()
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let settled = self.coordinator.settle();
        if !settled.requests.is_empty() {
            debug!(
                rejected = settled.requests.len(),
                "Refresh abandoned; cancelling parked requests"
            );
        }
        for p in settled.requests {
            let _ = p.reply.send(Err(Error::Cancelled));
        }
    }
}

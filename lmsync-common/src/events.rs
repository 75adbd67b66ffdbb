//! Event types for the lmsync event system
//!
//! Run lifecycle events are broadcast on an [`EventBus`] so observability
//! collaborators (log shippers, dashboards, the HTTP surface) can follow an
//! import run without the run waiting on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Import run state machine
///
/// IDLE → FETCHING → RECONCILING → WRITING → COMPLETED, with FAILED
/// reachable from every non-terminal state and CANCELLED reachable while
/// items are being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    /// Created, lock not yet held
    Idle,
    /// Manifest fetch and file staging
    Fetching,
    /// Normalization and diff against the repository index
    Reconciling,
    /// Applying decisions to the record store
    Writing,
    /// Finished; item-level failures may be present
    Completed,
    /// Aborted on a run-level error
    Failed,
    /// Stopped between items on request
    Cancelled,
}

impl RunState {
    /// Terminal states release the run lock
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Fetching => "FETCHING",
            RunState::Reconciling => "RECONCILING",
            RunState::Writing => "WRITING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item result reported while writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemOutcome {
    Created,
    Reactivated,
    Updated,
    Skipped,
    Retired,
    Failed,
}

/// lmsync event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Run acquired the lock and left IDLE
    RunStarted {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Run moved to a new state
    RunStateChanged {
        run_id: Uuid,
        old_state: RunState,
        new_state: RunState,
        timestamp: DateTime<Utc>,
    },

    /// One manifest entry or retirement was handled
    ItemProcessed {
        run_id: Uuid,
        /// None when the entry failed before its id could be read
        external_id: Option<String>,
        outcome: ItemOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Run reached a terminal state
    RunFinished {
        run_id: Uuid,
        state: RunState,
        created: usize,
        reactivated: usize,
        updated: usize,
        skipped: usize,
        retired: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    /// Event name used as the SSE event type
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::RunStarted { .. } => "RunStarted",
            SyncEvent::RunStateChanged { .. } => "RunStateChanged",
            SyncEvent::ItemProcessed { .. } => "ItemProcessed",
            SyncEvent::RunFinished { .. } => "RunFinished",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            SyncEvent::RunStarted { run_id, .. }
            | SyncEvent::RunStateChanged { run_id, .. }
            | SyncEvent::ItemProcessed { run_id, .. }
            | SyncEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block the run)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: SyncEvent) -> Result<usize, broadcast::error::SendError<SyncEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

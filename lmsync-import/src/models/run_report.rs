//! Run report and run state tracking
//!
//! One [`RunReport`] is created per import run. It carries the run state
//! machine and aggregates every item-level outcome.

use chrono::{DateTime, Utc};
use lmsync_common::events::{ItemOutcome, RunState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage an item failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    /// Normalization or manifest-level validation
    Validation,
    /// Downloading or hashing a file before normalization
    Staging,
    /// Applying the decision to the record store
    Write,
}

/// Item-level error detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Absent when the entry had no usable id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    /// Zero-based position in the manifest (absent for retirements)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,

    pub stage: FailureStage,

    /// Machine-readable code (e.g., "MISSING_FIELD", "CONFLICT")
    pub code: String,

    pub message: String,
}

/// Per-outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub created: usize,
    pub reactivated: usize,
    pub updated: usize,
    pub skipped: usize,
    pub retired: usize,
    pub failed: usize,
}

/// State change of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub run_id: Uuid,
    pub old_state: RunState,
    pub new_state: RunState,
    pub transitioned_at: DateTime<Utc>,
}

/// Outcome of one import run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    #[serde(default)]
    pub items_failed: Vec<ItemFailure>,
    /// Run-level error that moved the run to FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            started_at: Utc::now(),
            ended_at: None,
            counts: RunCounts::default(),
            items_failed: Vec::new(),
            fatal_error: None,
        }
    }

    /// Move to `new_state`, stamping the end time on terminal states
    pub fn transition_to(&mut self, new_state: RunState) -> StateTransition {
        let transition = StateTransition {
            run_id: self.run_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;

        if new_state.is_terminal() {
            self.ended_at = Some(transition.transitioned_at);
        }

        transition
    }

    /// Count a successful item outcome
    pub fn record_outcome(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Created => self.counts.created += 1,
            ItemOutcome::Reactivated => self.counts.reactivated += 1,
            ItemOutcome::Updated => self.counts.updated += 1,
            ItemOutcome::Skipped => self.counts.skipped += 1,
            ItemOutcome::Retired => self.counts.retired += 1,
            ItemOutcome::Failed => self.counts.failed += 1,
        }
    }

    /// Record an item-level failure; the run continues
    pub fn record_failure(&mut self, failure: ItemFailure) {
        self.counts.failed += 1;
        self.items_failed.push(failure);
    }

    /// Abort with a run-level error
    pub fn fail(&mut self, message: String) -> StateTransition {
        self.fatal_error = Some(message);
        self.transition_to(RunState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Decisions that changed the repository
    pub fn changes(&self) -> usize {
        self.counts.created + self.counts.reactivated + self.counts.updated + self.counts.retired
    }
}

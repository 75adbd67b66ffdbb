//! Test Helper Utilities
//!
//! Shared utilities for lmsync-import integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod faulty_store;
pub mod lms_double;

pub use db_utils::{active_external_ids, count_rows, create_test_db, record_row, RecordRow};
pub use faulty_store::FaultyStore;
pub use lms_double::{entry, file_entry, sha256_of, ScriptedLms};

use async_trait::async_trait;
use lmsync_common::events::EventBus;
use lmsync_import::models::RunReport;
use lmsync_import::services::{normalizer_for, FailureNotifier, NotifyError, RunController};
use lmsync_import::config::SchemaProfile;
use lmsync_import::utils::RetryPolicy;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Retry policy without real waiting
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

/// Controller over the scripted LMS and the (possibly faulty) store
pub fn controller(pool: &SqlitePool, lms: &Arc<ScriptedLms>, store: &Arc<FaultyStore>) -> RunController {
    profile_controller(pool, lms, store, SchemaProfile::Generic)
}

pub fn profile_controller(
    pool: &SqlitePool,
    lms: &Arc<ScriptedLms>,
    store: &Arc<FaultyStore>,
    profile: SchemaProfile,
) -> RunController {
    RunController::new(
        pool.clone(),
        lms.clone(),
        store.clone(),
        Arc::from(normalizer_for(profile)),
        EventBus::new(256),
    )
    .with_retry(fast_retry(3))
}

/// Keeps the run id of every notified report
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<Uuid>>,
}

impl RecordingNotifier {
    pub fn notified(&self) -> Vec<Uuid> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureNotifier for RecordingNotifier {
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError> {
        self.notified.lock().unwrap().push(report.run_id);
        Ok(())
    }
}

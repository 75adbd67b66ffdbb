//! Import run orchestration
//!
//! State progression:
//! IDLE → FETCHING → RECONCILING → WRITING → COMPLETED
//!
//! FAILED is reachable from every non-terminal state on a run-level error
//! (authentication, including a rejected file download, malformed manifest,
//! exhausted manifest retries, index read failure, loss of the run lock).
//! CANCELLED is reachable between items. Item-level errors never change the
//! run state; they are recorded in the report.

use chrono::Utc;
use lmsync_common::events::{EventBus, ItemOutcome, RunState, SyncEvent};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{LmsConfig, RunConfig};
use crate::db::records::{RecordStore, SqliteRecordStore};
use crate::db::runs;
use crate::models::{CanonicalRecord, FailureStage, ItemFailure, ManifestEntry, RunReport};
use crate::services::file_stager::FileStager;
use crate::services::lms_client::{FetchError, LmsClient, LmsSource};
use crate::services::normalizer::{normalizer_for, Normalizer, ValidationError};
use crate::services::notifier::FailureNotifier;
use crate::services::reconciler::{reconcile, Decision};
use crate::services::repository_writer::{RepositoryWriter, WriteError};
use crate::utils::{retry_transient, RetryPolicy};

/// Reasons a run is rejected before it starts
#[derive(Debug, Error)]
pub enum RunError {
    /// Another run holds the lock; never queued
    #[error("Import run already in progress")]
    RunInProgress,

    /// The lock table could not be read or written
    #[error("Run lock error: {0}")]
    Lock(String),
}

/// Why a run stopped early
enum Halt {
    Failed(String),
    Cancelled,
}

/// Entry that survived staging, with its manifest position
struct StagedEntry {
    position: usize,
    entry: ManifestEntry,
}

/// Renews the run lock between items so a long run is never mistaken for
/// an abandoned one
struct LockHeartbeat {
    run_id: Uuid,
    every: Duration,
    last: Instant,
}

impl LockHeartbeat {
    fn new(run_id: Uuid, lock_ttl: Duration) -> Self {
        Self {
            run_id,
            every: lock_ttl / 4,
            last: Instant::now(),
        }
    }

    async fn beat(&mut self, pool: &SqlitePool) -> Result<(), Halt> {
        if self.last.elapsed() < self.every {
            return Ok(());
        }

        match runs::refresh_run_lock(pool, self.run_id).await {
            Ok(true) => {
                self.last = Instant::now();
                Ok(())
            }
            Ok(false) => Err(Halt::Failed("Run lock lost to another process".to_string())),
            Err(e) => Err(Halt::Failed(format!("Run lock refresh failed: {}", e))),
        }
    }
}

/// Rejected credentials on a file download end the run like on the manifest
fn download_auth_halt(error: &FetchError) -> Halt {
    Halt::Failed(format!("File download failed: {}", error))
}

/// Drives one import run end to end
pub struct RunController {
    pool: SqlitePool,
    source: Arc<dyn LmsSource>,
    store: Arc<dyn RecordStore>,
    normalizer: Arc<dyn Normalizer>,
    retry: RetryPolicy,
    run_config: RunConfig,
    local_files: HashMap<String, PathBuf>,
    notifier: Option<Arc<dyn FailureNotifier>>,
    event_bus: EventBus,
}

impl RunController {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn LmsSource>,
        store: Arc<dyn RecordStore>,
        normalizer: Arc<dyn Normalizer>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pool,
            source,
            store,
            normalizer,
            retry: RetryPolicy::default(),
            run_config: RunConfig::default(),
            local_files: HashMap::new(),
            notifier: None,
            event_bus,
        }
    }

    /// Controller wired to the HTTP LMS client and the SQLite record store
    pub fn from_config(
        pool: SqlitePool,
        lms_config: &LmsConfig,
        run_config: RunConfig,
        event_bus: EventBus,
    ) -> Result<Self, FetchError> {
        let source: Arc<dyn LmsSource> = Arc::new(LmsClient::new(lms_config)?);
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool.clone()));
        let normalizer: Arc<dyn Normalizer> = Arc::from(normalizer_for(lms_config.schema_profile));

        Ok(Self::new(pool, source, store, normalizer, event_bus)
            .with_retry(lms_config.retry)
            .with_run_config(run_config)
            .with_local_files(lms_config.local_files.clone()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }

    /// Serve these download references from disk instead of the LMS
    pub fn with_local_files(mut self, local_files: HashMap<String, PathBuf>) -> Self {
        self.local_files = local_files;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Execute one run to completion
    pub async fn run(&self) -> Result<RunReport, RunError> {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Execute one run, stopping between items once `cancel` fires
    ///
    /// Returns `RunInProgress` immediately if another run holds the lock.
    /// Every other outcome, including FAILED, is reported through the
    /// returned report.
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();

        let acquired = runs::acquire_run_lock(&self.pool, run_id, self.run_config.lock_ttl)
            .await
            .map_err(|e| RunError::Lock(e.to_string()))?;
        if !acquired {
            tracing::info!(run_id = %run_id, "Run rejected: another import run holds the lock");
            return Err(RunError::RunInProgress);
        }

        let mut report = RunReport::new(run_id);
        tracing::info!(run_id = %run_id, "Import run started");
        self.event_bus.emit_lossy(SyncEvent::RunStarted {
            run_id,
            timestamp: Utc::now(),
        });

        match self.execute(&mut report, &cancel).await {
            Ok(()) => self.transition(&mut report, RunState::Completed).await,
            Err(Halt::Cancelled) => {
                tracing::warn!(run_id = %run_id, "Import run cancelled");
                self.transition(&mut report, RunState::Cancelled).await;
            }
            Err(Halt::Failed(message)) => {
                tracing::error!(run_id = %run_id, error = %message, "Import run failed");
                let transition = report.fail(message);
                self.announce(&report, transition.old_state, transition.new_state).await;
            }
        }

        if let Err(e) = runs::release_run_lock(&self.pool, run_id).await {
            tracing::error!(run_id = %run_id, error = %e, "Failed to release run lock");
        }

        if report.state == RunState::Failed {
            self.notify_failure(&report).await;
        }

        let counts = report.counts;
        self.event_bus.emit_lossy(SyncEvent::RunFinished {
            run_id,
            state: report.state,
            created: counts.created,
            reactivated: counts.reactivated,
            updated: counts.updated,
            skipped: counts.skipped,
            retired: counts.retired,
            failed: counts.failed,
            timestamp: Utc::now(),
        });

        tracing::info!(
            run_id = %run_id,
            state = %report.state,
            created = counts.created,
            reactivated = counts.reactivated,
            updated = counts.updated,
            skipped = counts.skipped,
            retired = counts.retired,
            failed = counts.failed,
            "Import run finished"
        );

        Ok(report)
    }

    async fn execute(&self, report: &mut RunReport, cancel: &CancellationToken) -> Result<(), Halt> {
        self.transition(report, RunState::Fetching).await;

        let entries = retry_transient("fetch_manifest", &self.retry, || self.source.fetch_manifest())
            .await
            .map_err(|e| Halt::Failed(format!("Manifest fetch failed: {}", e)))?;
        tracing::info!(run_id = %report.run_id, entries = entries.len(), "Manifest fetched");

        let stager = FileStager::new(Arc::clone(&self.source), self.retry)
            .map(|stager| Arc::new(stager.with_local_files(self.local_files.clone())))
            .map_err(|e| Halt::Failed(format!("Cannot create staging directory: {}", e)))?;

        let mut heartbeat = LockHeartbeat::new(report.run_id, self.run_config.lock_ttl);
        let mut protected = HashSet::new();
        let staged = self
            .phase_staging(report, entries, &stager, &mut protected, &mut heartbeat, cancel)
            .await?;

        self.transition(report, RunState::Reconciling).await;
        let (mut incoming, positions) = self.phase_normalizing(report, staged, &mut protected);
        let derived = self.normalizer.derive(&incoming);
        incoming.extend(derived);

        let index = self
            .store
            .lookup_index()
            .await
            .map_err(|e| Halt::Failed(format!("Repository index read failed: {}", e)))?;

        // Aggregates cannot tell whether a failed row still belongs to them
        if report.counts.failed > 0 {
            protected.extend(
                index
                    .keys()
                    .filter(|id| self.normalizer.is_derived(id))
                    .cloned(),
            );
        }
        let decisions = reconcile(&index, &incoming, &protected);

        tracing::info!(
            run_id = %report.run_id,
            indexed = index.len(),
            incoming = incoming.len(),
            decisions = decisions.len(),
            protected = protected.len(),
            "Reconciliation complete"
        );

        self.transition(report, RunState::Writing).await;
        self.phase_writing(report, &decisions, &positions, &stager, &mut heartbeat, cancel)
            .await?;

        let files = stager.staged_count().await;
        tracing::debug!(run_id = %report.run_id, files, "Files downloaded during run");
        Ok(())
    }

    /// Complete file lists and drop duplicate ids
    ///
    /// Files without a manifest checksum are downloaded and hashed here so
    /// that every entry reaches the normalizer with content hashes.
    async fn phase_staging(
        &self,
        report: &mut RunReport,
        entries: Vec<ManifestEntry>,
        stager: &FileStager,
        protected: &mut HashSet<String>,
        heartbeat: &mut LockHeartbeat,
        cancel: &CancellationToken,
    ) -> Result<Vec<StagedEntry>, Halt> {
        let mut seen = HashSet::new();
        let mut staged = Vec::with_capacity(entries.len());

        for (position, mut entry) in entries.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            heartbeat.beat(&self.pool).await?;

            self.normalizer.prepare(&mut entry);
            let external_id = self.normalizer.external_id(&entry);

            if let Some(id) = &external_id {
                if !seen.insert(id.clone()) {
                    let error = ValidationError::DuplicateExternalId(id.clone());
                    self.fail_item(
                        report,
                        Some(id.clone()),
                        Some(position),
                        FailureStage::Validation,
                        error.code(),
                        error.to_string(),
                    );
                    continue;
                }
            }

            if let Err(e) = stager.fill_missing_checksums(&mut entry).await {
                if matches!(e, FetchError::Auth(_)) {
                    return Err(download_auth_halt(&e));
                }
                if let Some(id) = &external_id {
                    protected.insert(id.clone());
                }
                self.fail_item(
                    report,
                    external_id,
                    Some(position),
                    FailureStage::Staging,
                    e.code(),
                    e.to_string(),
                );
                continue;
            }

            staged.push(StagedEntry { position, entry });
        }

        Ok(staged)
    }

    /// Normalize every staged entry; returns records and their positions
    fn phase_normalizing(
        &self,
        report: &mut RunReport,
        staged: Vec<StagedEntry>,
        protected: &mut HashSet<String>,
    ) -> (Vec<CanonicalRecord>, HashMap<String, usize>) {
        let mut incoming = Vec::with_capacity(staged.len());
        let mut positions = HashMap::new();

        for StagedEntry { position, entry } in staged {
            match self.normalizer.normalize(&entry) {
                Ok(record) => {
                    positions.insert(record.external_id.clone(), position);
                    incoming.push(record);
                }
                Err(e) => {
                    let external_id = self.normalizer.external_id(&entry);
                    if let Some(id) = &external_id {
                        protected.insert(id.clone());
                    }
                    self.fail_item(
                        report,
                        external_id,
                        Some(position),
                        FailureStage::Validation,
                        e.code(),
                        e.to_string(),
                    );
                }
            }
        }

        (incoming, positions)
    }

    async fn phase_writing(
        &self,
        report: &mut RunReport,
        decisions: &[Decision],
        positions: &HashMap<String, usize>,
        stager: &Arc<FileStager>,
        heartbeat: &mut LockHeartbeat,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let writer = RepositoryWriter::new(Arc::clone(&self.store), Arc::clone(stager));

        for decision in decisions {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            heartbeat.beat(&self.pool).await?;

            let external_id = decision.external_id().to_string();
            match writer.apply(decision).await {
                Ok(outcome) => {
                    tracing::info!(
                        run_id = %report.run_id,
                        external_id = %external_id,
                        decision = decision.kind(),
                        record_id = %outcome.record_id,
                        version = outcome.version.version(),
                        files_transferred = outcome.files_transferred,
                        "Decision applied"
                    );
                    report.record_outcome(outcome.outcome);
                    self.event_bus.emit_lossy(SyncEvent::ItemProcessed {
                        run_id: report.run_id,
                        external_id: Some(external_id),
                        outcome: outcome.outcome,
                        timestamp: Utc::now(),
                    });
                }
                Err(WriteError::FileFetch(e @ FetchError::Auth(_))) => {
                    return Err(download_auth_halt(&e));
                }
                Err(e) => {
                    let position = positions.get(&external_id).copied();
                    self.fail_item(
                        report,
                        Some(external_id),
                        position,
                        FailureStage::Write,
                        e.code(),
                        e.to_string(),
                    );
                }
            }
        }

        Ok(())
    }

    fn fail_item(
        &self,
        report: &mut RunReport,
        external_id: Option<String>,
        position: Option<usize>,
        stage: FailureStage,
        code: &str,
        message: String,
    ) {
        tracing::warn!(
            run_id = %report.run_id,
            external_id = external_id.as_deref().unwrap_or("<unknown>"),
            position = ?position,
            stage = ?stage,
            code,
            error = %message,
            "Item failed"
        );

        self.event_bus.emit_lossy(SyncEvent::ItemProcessed {
            run_id: report.run_id,
            external_id: external_id.clone(),
            outcome: ItemOutcome::Failed,
            timestamp: Utc::now(),
        });

        report.record_failure(ItemFailure {
            external_id,
            position,
            stage,
            code: code.to_string(),
            message,
        });
    }

    /// Deliver a FAILED report; delivery problems are only logged
    async fn notify_failure(&self, report: &RunReport) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(e) = notifier.notify(report).await {
            tracing::warn!(run_id = %report.run_id, error = %e, "Failure notification not delivered");
        }
    }

    async fn transition(&self, report: &mut RunReport, new_state: RunState) {
        let transition = report.transition_to(new_state);
        self.announce(report, transition.old_state, transition.new_state).await;
    }

    /// Publish a state change and persist the report (failures logged only)
    async fn announce(&self, report: &RunReport, old_state: RunState, new_state: RunState) {
        tracing::debug!(run_id = %report.run_id, %old_state, %new_state, "Run state changed");

        self.event_bus.emit_lossy(SyncEvent::RunStateChanged {
            run_id: report.run_id,
            old_state,
            new_state,
            timestamp: Utc::now(),
        });

        if let Err(e) = runs::save_run(&self.pool, report).await {
            tracing::warn!(run_id = %report.run_id, error = %e, "Failed to persist run report");
        }
    }
}

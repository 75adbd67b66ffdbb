//! Fault-injecting record store
//!
//! Wraps the SQLite store and fails selected calls with conflicts or
//! storage errors. Can also fire a cancellation token after a number of
//! successful writes.

use async_trait::async_trait;
use lmsync_import::db::records::{FileAttachment, RecordStore, SqliteRecordStore, StoreError};
use lmsync_import::models::{CanonicalRecord, RecordSummary, RepositoryIndex};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct FaultyStore {
    inner: SqliteRecordStore,
    conflicts: AtomicUsize,
    storage_failures: Mutex<HashSet<String>>,
    fail_index: AtomicBool,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    writes: AtomicUsize,
    conflicts_raised: AtomicUsize,
}

impl FaultyStore {
    pub fn new(pool: &SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteRecordStore::new(pool.clone()),
            conflicts: AtomicUsize::new(0),
            storage_failures: Mutex::new(HashSet::new()),
            fail_index: AtomicBool::new(false),
            cancel_after: Mutex::new(None),
            writes: AtomicUsize::new(0),
            conflicts_raised: AtomicUsize::new(0),
        })
    }

    /// The next `n` create/update/retire calls fail with Conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Writes for `external_id` fail with a storage error
    pub fn fail_writes_for(&self, external_id: &str) {
        self.storage_failures
            .lock()
            .unwrap()
            .insert(external_id.to_string());
    }

    pub fn fail_index(&self) {
        self.fail_index.store(true, Ordering::SeqCst);
    }

    /// Cancel `token` once `n` writes have succeeded
    pub fn cancel_after_writes(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((n, token));
    }

    /// Successful create/update/retire calls
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn conflicts_raised(&self) -> usize {
        self.conflicts_raised.load(Ordering::SeqCst)
    }

    fn check_faults(&self, external_id: Option<&str>) -> Result<(), StoreError> {
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.conflicts_raised.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict("injected concurrent modification".to_string()));
        }

        if let Some(id) = external_id {
            if self.storage_failures.lock().unwrap().contains(id) {
                return Err(StoreError::Storage(format!("injected disk failure for {}", id)));
            }
        }

        Ok(())
    }

    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if writes >= *n {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn lookup_index(&self) -> Result<RepositoryIndex, StoreError> {
        if self.fail_index.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("injected index read failure".to_string()));
        }
        self.inner.lookup_index().await
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<RecordSummary>, StoreError> {
        self.inner.find_by_external_id(external_id).await
    }

    async fn has_blob(&self, content_hash: &str) -> Result<bool, StoreError> {
        self.inner.has_blob(content_hash).await
    }

    async fn create_record(
        &self,
        record: &CanonicalRecord,
        attachments: Vec<FileAttachment>,
    ) -> Result<Uuid, StoreError> {
        self.check_faults(Some(&record.external_id))?;
        let id = self.inner.create_record(record, attachments).await?;
        self.record_write();
        Ok(id)
    }

    async fn update_record(
        &self,
        record_id: Uuid,
        expected_version: u32,
        record: &CanonicalRecord,
        attachments: Vec<FileAttachment>,
        reactivate: bool,
    ) -> Result<u32, StoreError> {
        self.check_faults(Some(&record.external_id))?;
        let version = self
            .inner
            .update_record(record_id, expected_version, record, attachments, reactivate)
            .await?;
        self.record_write();
        Ok(version)
    }

    async fn retire_record(&self, record_id: Uuid, expected_version: u32) -> Result<(), StoreError> {
        self.check_faults(None)?;
        self.inner.retire_record(record_id, expected_version).await?;
        self.record_write();
        Ok(())
    }
}

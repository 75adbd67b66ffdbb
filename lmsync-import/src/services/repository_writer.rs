//! Repository writer
//!
//! Applies reconciliation decisions to the record store, one item at a
//! time. Every byte an item needs is obtained before the store is touched,
//! so a failed download never leaves a partial write behind.
//!
//! A conflict (the record changed since the index snapshot) is retried
//! once against a freshly read record; a second conflict is surfaced.

use lmsync_common::events::ItemOutcome;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::db::records::{FileAttachment, RecordStore, StoreError};
use crate::models::{CanonicalRecord, FileDescriptor};
use crate::services::file_stager::FileStager;
use crate::services::lms_client::FetchError;
use crate::services::reconciler::{classify, Decision};

/// Version effect of one applied decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionChange {
    /// A new version was written
    New(u32),
    /// Version untouched (skip, retire)
    Unchanged(u32),
}

impl VersionChange {
    pub fn version(&self) -> u32 {
        match self {
            VersionChange::New(v) | VersionChange::Unchanged(v) => *v,
        }
    }
}

/// Result of applying one decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub record_id: Uuid,
    pub version: VersionChange,
    pub outcome: ItemOutcome,
    /// Files whose bytes were uploaded (the rest were re-linked)
    pub files_transferred: usize,
}

/// Item-level write errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    /// Concurrent modification persisted after one refreshed retry
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Bytes for an added or changed file could not be obtained
    #[error("File fetch failed: {0}")]
    FileFetch(FetchError),
}

impl WriteError {
    pub fn code(&self) -> &'static str {
        match self {
            WriteError::Conflict(_) => "CONFLICT",
            WriteError::Storage(_) => "STORAGE_ERROR",
            WriteError::FileFetch(e) => e.code(),
        }
    }
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => WriteError::Conflict(msg),
            StoreError::Storage(msg) => WriteError::Storage(msg),
        }
    }
}

/// Applies decisions against a [`RecordStore`]
pub struct RepositoryWriter {
    store: Arc<dyn RecordStore>,
    stager: Arc<FileStager>,
}

impl RepositoryWriter {
    pub fn new(store: Arc<dyn RecordStore>, stager: Arc<FileStager>) -> Self {
        Self { store, stager }
    }

    /// Apply one decision, retrying once on conflict
    pub async fn apply(&self, decision: &Decision) -> Result<WriteOutcome, WriteError> {
        match self.try_apply(decision).await {
            Err(WriteError::Conflict(msg)) => {
                tracing::warn!(
                    external_id = %decision.external_id(),
                    error = %msg,
                    "Write conflict, retrying with refreshed record"
                );
                let refreshed = self.refresh(decision).await?;
                self.try_apply(&refreshed).await
            }
            result => result,
        }
    }

    /// Recompute `decision` against the record's current stored state
    async fn refresh(&self, decision: &Decision) -> Result<Decision, WriteError> {
        let external_id = decision.external_id();
        let current = self.store.find_by_external_id(external_id).await?;

        match decision {
            Decision::Create { record, .. } | Decision::Update { record, .. } => {
                Ok(classify(current.as_ref(), record))
            }
            Decision::Skip { .. } => Ok(decision.clone()),
            Decision::Retire { .. } => match current {
                Some(existing) if existing.is_active() => Ok(Decision::Retire {
                    external_id: external_id.to_string(),
                    existing,
                }),
                // Retired by someone else in the meantime; nothing left to do
                Some(existing) => Ok(Decision::Skip {
                    external_id: external_id.to_string(),
                    existing,
                }),
                None => Err(WriteError::Storage(format!(
                    "record {} disappeared from the repository",
                    external_id
                ))),
            },
        }
    }

    async fn try_apply(&self, decision: &Decision) -> Result<WriteOutcome, WriteError> {
        match decision {
            Decision::Create {
                record,
                reactivate: None,
            } => {
                let (attachments, transferred) = self.attachments(record, &[]).await?;
                let record_id = self.store.create_record(record, attachments).await?;

                Ok(WriteOutcome {
                    record_id,
                    version: VersionChange::New(1),
                    outcome: ItemOutcome::Created,
                    files_transferred: transferred,
                })
            }
            Decision::Create {
                record,
                reactivate: Some(existing),
            } => {
                let (attachments, transferred) = self.attachments(record, &existing.files).await?;
                let version = self
                    .store
                    .update_record(existing.record_id, existing.version, record, attachments, true)
                    .await?;

                Ok(WriteOutcome {
                    record_id: existing.record_id,
                    version: VersionChange::New(version),
                    outcome: ItemOutcome::Reactivated,
                    files_transferred: transferred,
                })
            }
            Decision::Update { record, existing, .. } => {
                let (attachments, transferred) = self.attachments(record, &existing.files).await?;
                let version = self
                    .store
                    .update_record(existing.record_id, existing.version, record, attachments, false)
                    .await?;

                Ok(WriteOutcome {
                    record_id: existing.record_id,
                    version: VersionChange::New(version),
                    outcome: ItemOutcome::Updated,
                    files_transferred: transferred,
                })
            }
            Decision::Skip { existing, .. } => Ok(WriteOutcome {
                record_id: existing.record_id,
                version: VersionChange::Unchanged(existing.version),
                outcome: ItemOutcome::Skipped,
                files_transferred: 0,
            }),
            Decision::Retire { existing, .. } => {
                self.store.retire_record(existing.record_id, existing.version).await?;

                Ok(WriteOutcome {
                    record_id: existing.record_id,
                    version: VersionChange::Unchanged(existing.version),
                    outcome: ItemOutcome::Retired,
                    files_transferred: 0,
                })
            }
        }
    }

    /// Attachments for `record` in manifest order
    ///
    /// Content already held by the previous version or anywhere in the blob
    /// store is re-linked; only new content is read from the stager.
    async fn attachments(
        &self,
        record: &CanonicalRecord,
        previous: &[FileDescriptor],
    ) -> Result<(Vec<FileAttachment>, usize), WriteError> {
        let mut attachments = Vec::with_capacity(record.files.len());
        let mut transferred = 0;

        for file in &record.files {
            let known = previous.iter().any(|p| p.content_hash == file.content_hash)
                || self.store.has_blob(&file.content_hash).await?;

            if known {
                attachments.push(FileAttachment::reference(file.clone()));
            } else {
                let bytes = self.stager.read(file).await.map_err(WriteError::FileFetch)?;
                tracing::debug!(
                    external_id = %record.external_id,
                    file = %file.name,
                    bytes = bytes.len(),
                    "File content staged for upload"
                );
                attachments.push(FileAttachment::upload(file.clone(), bytes));
                transferred += 1;
            }
        }

        Ok((attachments, transferred))
    }
}

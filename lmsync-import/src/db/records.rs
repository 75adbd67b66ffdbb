//! Repository record store
//!
//! The narrow read/write contract the pipeline uses against the repository,
//! plus its SQLite implementation. Every mutating call commits in a single
//! transaction, so one item's effect is all-or-nothing.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CanonicalRecord, FileDescriptor, RecordMetadata, RecordStatus, RecordSummary, RepositoryIndex,
};

/// Record store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Concurrent modification detected; a refreshed read may succeed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend failure; not retried
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(db_err.message().to_string())
            }
            _ => StoreError::Storage(err.to_string()),
        }
    }
}

/// How a file's bytes reach the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePayload {
    /// New content to store under the descriptor's hash
    Upload(Vec<u8>),
    /// Content already stored under the descriptor's hash; re-linked only
    Reference,
}

/// A file to attach to the version being written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub descriptor: FileDescriptor,
    pub payload: FilePayload,
}

impl FileAttachment {
    pub fn upload(descriptor: FileDescriptor, bytes: Vec<u8>) -> Self {
        Self {
            descriptor,
            payload: FilePayload::Upload(bytes),
        }
    }

    pub fn reference(descriptor: FileDescriptor) -> Self {
        Self {
            descriptor,
            payload: FilePayload::Reference,
        }
    }
}

/// Repository boundary used by the reconciler and the writer
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records keyed by external id, active and retired
    async fn lookup_index(&self) -> Result<RepositoryIndex, StoreError>;

    /// Fresh state of one record
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<RecordSummary>, StoreError>;

    /// Whether content with this hash is already stored
    async fn has_blob(&self, content_hash: &str) -> Result<bool, StoreError>;

    /// New record at version 1; returns its identifier
    async fn create_record(
        &self,
        record: &CanonicalRecord,
        attachments: Vec<FileAttachment>,
    ) -> Result<Uuid, StoreError>;

    /// New version of an existing record; fails with Conflict when the
    /// stored version is not `expected_version`
    async fn update_record(
        &self,
        record_id: Uuid,
        expected_version: u32,
        record: &CanonicalRecord,
        attachments: Vec<FileAttachment>,
        reactivate: bool,
    ) -> Result<u32, StoreError>;

    /// Mark inactive without touching versions, metadata or files
    async fn retire_record(&self, record_id: Uuid, expected_version: u32) -> Result<(), StoreError>;
}

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_summaries(&self, external_id: Option<&str>) -> Result<Vec<RecordSummary>, StoreError> {
        let filter = if external_id.is_some() {
            "WHERE r.external_id = ?"
        } else {
            ""
        };

        let sql = format!(
            r#"
            SELECT r.record_id, r.external_id, r.status, r.current_version, v.metadata
            FROM records r
            JOIN record_versions v
              ON v.record_id = r.record_id AND v.version = r.current_version
            {}
            "#,
            filter
        );

        let mut query = sqlx::query(&sql);
        if let Some(id) = external_id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let record_id: String = row.try_get("record_id")?;
            let status: String = row.try_get("status")?;
            let version: i64 = row.try_get("current_version")?;
            let metadata: String = row.try_get("metadata")?;

            let record_id = Uuid::parse_str(&record_id)
                .map_err(|e| StoreError::Storage(format!("corrupt record_id {}: {}", record_id, e)))?;
            let status = RecordStatus::parse(&status)
                .ok_or_else(|| StoreError::Storage(format!("corrupt status {}", status)))?;
            let metadata: RecordMetadata = serde_json::from_str(&metadata)
                .map_err(|e| StoreError::Storage(format!("corrupt metadata for {}: {}", record_id, e)))?;

            summaries.push(RecordSummary {
                record_id,
                external_id: row.try_get("external_id")?,
                version: version as u32,
                status,
                metadata,
                files: Vec::new(),
            });
        }

        let mut files = self.load_current_files(external_id).await?;
        for summary in &mut summaries {
            summary.files = files.remove(&summary.record_id).unwrap_or_default();
        }

        Ok(summaries)
    }

    async fn load_current_files(
        &self,
        external_id: Option<&str>,
    ) -> Result<HashMap<Uuid, Vec<FileDescriptor>>, StoreError> {
        let filter = if external_id.is_some() {
            "WHERE r.external_id = ?"
        } else {
            ""
        };

        let sql = format!(
            r#"
            SELECT f.record_id, f.name, f.content_hash, f.size, f.reference
            FROM record_files f
            JOIN records r
              ON f.record_id = r.record_id AND f.version = r.current_version
            {}
            ORDER BY f.record_id, f.position
            "#,
            filter
        );

        let mut query = sqlx::query(&sql);
        if let Some(id) = external_id {
            query = query.bind(id);
        }

        let mut files: HashMap<Uuid, Vec<FileDescriptor>> = HashMap::new();
        for row in query.fetch_all(&self.pool).await? {
            let record_id: String = row.try_get("record_id")?;
            let record_id = Uuid::parse_str(&record_id)
                .map_err(|e| StoreError::Storage(format!("corrupt record_id {}: {}", record_id, e)))?;
            let size: Option<i64> = row.try_get("size")?;

            files.entry(record_id).or_default().push(FileDescriptor {
                name: row.try_get("name")?,
                content_hash: row.try_get("content_hash")?,
                size: size.map(|s| s as u64),
                reference: row.try_get("reference")?,
            });
        }

        Ok(files)
    }
}

/// Insert a version row and its files inside `tx`
async fn insert_version(
    tx: &mut Transaction<'_, Sqlite>,
    record_id: &str,
    version: u32,
    record: &CanonicalRecord,
    attachments: &[FileAttachment],
    now: &str,
) -> Result<(), StoreError> {
    let metadata = serde_json::to_string(&record.metadata)
        .map_err(|e| StoreError::Storage(format!("serialize metadata: {}", e)))?;

    sqlx::query(
        "INSERT INTO record_versions (record_id, version, metadata, source_modified_at, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(record_id)
    .bind(version as i64)
    .bind(&metadata)
    .bind(record.source_modified_at.map(|dt| dt.to_rfc3339()))
    .bind(now)
    .execute(&mut **tx)
    .await?;

    for (position, attachment) in attachments.iter().enumerate() {
        let descriptor = &attachment.descriptor;

        if let FilePayload::Upload(bytes) = &attachment.payload {
            sqlx::query(
                "INSERT INTO blobs (content_hash, size, content, created_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(content_hash) DO NOTHING",
            )
            .bind(&descriptor.content_hash)
            .bind(bytes.len() as i64)
            .bind(bytes.as_slice())
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO record_files (record_id, version, position, name, content_hash, size, reference)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record_id)
        .bind(version as i64)
        .bind(position as i64)
        .bind(&descriptor.name)
        .bind(&descriptor.content_hash)
        .bind(descriptor.size.map(|s| s as i64))
        .bind(&descriptor.reference)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn lookup_index(&self) -> Result<RepositoryIndex, StoreError> {
        let summaries = self.load_summaries(None).await?;
        Ok(summaries
            .into_iter()
            .map(|s| (s.external_id.clone(), s))
            .collect())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<RecordSummary>, StoreError> {
        Ok(self.load_summaries(Some(external_id)).await?.into_iter().next())
    }

    async fn has_blob(&self, content_hash: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blobs WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn create_record(
        &self,
        record: &CanonicalRecord,
        attachments: Vec<FileAttachment>,
    ) -> Result<Uuid, StoreError> {
        let record_id = Uuid::new_v4();
        let id = record_id.to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO records (record_id, external_id, status, current_version, created_at, updated_at)
             VALUES (?, ?, 'active', 1, ?, ?)",
        )
        .bind(&id)
        .bind(&record.external_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_version(&mut tx, &id, 1, record, &attachments, &now).await?;

        tx.commit().await?;

        tracing::debug!(record_id = %record_id, external_id = %record.external_id, "Record created");
        Ok(record_id)
    }

    async fn update_record(
        &self,
        record_id: Uuid,
        expected_version: u32,
        record: &CanonicalRecord,
        attachments: Vec<FileAttachment>,
        reactivate: bool,
    ) -> Result<u32, StoreError> {
        let id = record_id.to_string();
        let new_version = expected_version + 1;
        let expected_status = if reactivate {
            RecordStatus::Retired
        } else {
            RecordStatus::Active
        };
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE records SET current_version = ?, status = 'active', updated_at = ?
             WHERE record_id = ? AND current_version = ? AND status = ?",
        )
        .bind(new_version as i64)
        .bind(&now)
        .bind(&id)
        .bind(expected_version as i64)
        .bind(expected_status.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "record {} is no longer {} at version {}",
                record_id,
                expected_status.as_str(),
                expected_version
            )));
        }

        insert_version(&mut tx, &id, new_version, record, &attachments, &now).await?;

        tx.commit().await?;

        tracing::debug!(record_id = %record_id, version = new_version, reactivate, "Record version written");
        Ok(new_version)
    }

    async fn retire_record(&self, record_id: Uuid, expected_version: u32) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE records SET status = 'retired', updated_at = ?
             WHERE record_id = ? AND current_version = ? AND status = 'active'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(record_id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "record {} is no longer active at version {}",
                record_id, expected_version
            )));
        }

        tracing::debug!(record_id = %record_id, "Record retired");
        Ok(())
    }
}

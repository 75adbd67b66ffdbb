//! Canonical records and repository-side summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Canonical metadata payload
///
/// `fields` is ordered so that serialized metadata is byte-stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

/// File attached to a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Unique within one record
    pub name: String,
    /// Opaque content hash; identical hash means identical content
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Download reference at the LMS
    pub reference: String,
}

/// Normalized, repository-agnostic view of one manifest entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// LMS-namespaced identifier, e.g. `lms:c1`
    pub external_id: String,
    pub metadata: RecordMetadata,
    /// Manifest order is preserved
    pub files: Vec<FileDescriptor>,
    pub source_modified_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of a repository record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Retired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(RecordStatus::Active),
            "retired" => Some(RecordStatus::Retired),
            _ => None,
        }
    }
}

/// Current state of a persisted repository record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    /// Assigned once on creation, never changes
    pub record_id: Uuid,
    pub external_id: String,
    pub version: u32,
    pub status: RecordStatus,
    pub metadata: RecordMetadata,
    pub files: Vec<FileDescriptor>,
}

impl RecordSummary {
    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }
}

/// Snapshot of the repository keyed by external id
pub type RepositoryIndex = HashMap<String, RecordSummary>;

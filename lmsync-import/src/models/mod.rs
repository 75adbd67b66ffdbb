//! Data models for lmsync-import
//!
//! - Manifest entries as fetched from the LMS
//! - Canonical records and repository summaries
//! - Run report and state transitions

pub mod manifest;
pub mod record;
pub mod run_report;

pub use manifest::{ManifestEntry, ManifestFile};
pub use record::{
    CanonicalRecord, FileDescriptor, RecordMetadata, RecordStatus, RecordSummary, RepositoryIndex,
};
pub use run_report::{FailureStage, ItemFailure, RunCounts, RunReport, StateTransition};

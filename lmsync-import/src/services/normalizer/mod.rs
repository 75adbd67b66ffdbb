//! Manifest normalization
//!
//! Converts raw [`ManifestEntry`] rows into [`CanonicalRecord`]s. The
//! schema variant is chosen once at configuration time through
//! [`normalizer_for`]; every variant is pure and deterministic.

mod generic;
mod moodle;

pub use generic::GenericNormalizer;
pub use moodle::MoodleNormalizer;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

use crate::config::SchemaProfile;
use crate::models::{CanonicalRecord, FileDescriptor, ManifestEntry, ManifestFile};

/// Item-level validation failure; never aborts a run
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Duplicate external id in manifest: {0}")]
    DuplicateExternalId(String),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingField(_) => "MISSING_FIELD",
            ValidationError::InvalidField { .. } => "INVALID_FIELD",
            ValidationError::DuplicateExternalId(_) => "DUPLICATE_EXTERNAL_ID",
        }
    }
}

/// Schema-specific conversion of manifest entries
pub trait Normalizer: Send + Sync {
    fn profile(&self) -> SchemaProfile;

    /// Bring the entry's file list into the common `files` shape
    ///
    /// Runs before file staging so that missing checksums can be filled in.
    fn prepare(&self, _entry: &mut ManifestEntry) {}

    /// External id of an entry, if one can be derived
    fn external_id(&self, entry: &ManifestEntry) -> Option<String>;

    /// Convert one entry
    fn normalize(&self, entry: &ManifestEntry) -> Result<CanonicalRecord, ValidationError>;

    /// Aggregate records built from all records normalized in a run
    fn derive(&self, _records: &[CanonicalRecord]) -> Vec<CanonicalRecord> {
        Vec::new()
    }

    /// Whether `external_id` names a record produced by [`Normalizer::derive`]
    fn is_derived(&self, _external_id: &str) -> bool {
        false
    }
}

/// Select the normalizer for a schema profile
pub fn normalizer_for(profile: SchemaProfile) -> Box<dyn Normalizer> {
    match profile {
        SchemaProfile::Generic => Box::new(GenericNormalizer),
        SchemaProfile::Moodle => Box::new(MoodleNormalizer),
    }
}

/// Trimmed, non-empty text
fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(value: Option<&str>, field: &str) -> Result<String, ValidationError> {
    non_empty(value).ok_or_else(|| ValidationError::MissingField(field.to_string()))
}

/// Reject entries whose fields could not be decoded at all
fn check_decoded(entry: &ManifestEntry) -> Result<(), ValidationError> {
    match &entry.decode_error {
        Some(reason) => Err(ValidationError::invalid("entry", reason.clone())),
        None => Ok(()),
    }
}

fn parse_modified(value: Option<&str>) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match non_empty(value) {
        None => Ok(None),
        Some(raw) => lmsync_common::time::parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| ValidationError::invalid("last_modified", format!("unparseable timestamp {:?}", raw))),
    }
}

/// Validate a file list: names unique, reference and hash present
fn normalize_files(files: &[ManifestFile]) -> Result<Vec<FileDescriptor>, ValidationError> {
    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(files.len());

    for (i, file) in files.iter().enumerate() {
        let name = required(file.name.as_deref(), &format!("files[{}].name", i))?;
        let reference = required(file.reference.as_deref(), &format!("files[{}].reference", i))?;
        let content_hash = required(file.checksum.as_deref(), &format!("files[{}].checksum", i))?;

        if !seen.insert(name.clone()) {
            return Err(ValidationError::invalid(
                "files",
                format!("duplicate file name {:?}", name),
            ));
        }

        descriptors.push(FileDescriptor {
            name,
            content_hash,
            size: file.size,
            reference,
        });
    }

    Ok(descriptors)
}

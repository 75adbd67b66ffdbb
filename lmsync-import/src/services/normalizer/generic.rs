//! Generic manifest profile
//!
//! External ids are namespaced `lms:<id>`. Title and description are taken
//! verbatim (trimmed); a handful of well-known optional keys are copied
//! into structured metadata.

use serde_json::Value;
use std::collections::BTreeMap;

use super::{check_decoded, non_empty, normalize_files, parse_modified, required, Normalizer, ValidationError};
use crate::config::SchemaProfile;
use crate::models::{CanonicalRecord, ManifestEntry, RecordMetadata};

const NAMESPACE: &str = "lms";

/// Optional keys carried into `metadata.fields`
const PASSTHROUGH_FIELDS: &[&str] = &["language", "keywords", "contributors", "license"];

#[derive(Debug, Clone, Copy, Default)]
pub struct GenericNormalizer;

impl Normalizer for GenericNormalizer {
    fn profile(&self) -> SchemaProfile {
        SchemaProfile::Generic
    }

    fn external_id(&self, entry: &ManifestEntry) -> Option<String> {
        non_empty(entry.id.as_deref()).map(|id| format!("{}:{}", NAMESPACE, id))
    }

    fn normalize(&self, entry: &ManifestEntry) -> Result<CanonicalRecord, ValidationError> {
        check_decoded(entry)?;

        let external_id = self
            .external_id(entry)
            .ok_or_else(|| ValidationError::MissingField("id".to_string()))?;
        let title = required(entry.title.as_deref(), "title")?;

        let mut fields = BTreeMap::new();
        for key in PASSTHROUGH_FIELDS {
            match entry.extra.get(*key) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    fields.insert((*key).to_string(), value.clone());
                }
            }
        }

        let files = normalize_files(entry.files.as_deref().unwrap_or_default())?;

        Ok(CanonicalRecord {
            external_id,
            metadata: RecordMetadata {
                title,
                description: non_empty(entry.description.as_deref()),
                fields,
            },
            files,
            source_modified_at: parse_modified(entry.last_modified.as_deref())?,
        })
    }
}

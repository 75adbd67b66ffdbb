//! Raw manifest entries as delivered by the LMS
//!
//! Every field is optional at the wire level; required-field checks happen
//! in the normalizers so that one bad row never invalidates the manifest.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Keys decoded into the typed fields of [`ManifestEntry`]
const TYPED_KEYS: &[&str] = &["id", "title", "description", "files", "last_modified", "modified"];

/// One course/material descriptor from the manifest listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// LMS-assigned identifier (string or number on the wire)
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
    /// Explicit file list; `None` when the entry carries no `files` key
    #[serde(default)]
    pub files: Option<Vec<ManifestFile>>,
    /// RFC 3339 timestamp or unix seconds
    #[serde(default, alias = "modified", deserialize_with = "lenient_string")]
    pub last_modified: Option<String>,
    /// Every other key, kept for schema-specific normalizers
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    /// Set when the entry object could not be decoded into the fields above
    #[serde(skip)]
    pub decode_error: Option<String>,
}

/// File reference inside a manifest entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, alias = "hash", deserialize_with = "lenient_string")]
    pub checksum: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub size: Option<u64>,
    /// Download reference, absolute URL or relative to the manifest endpoint
    #[serde(default, alias = "url", deserialize_with = "lenient_string")]
    pub reference: Option<String>,
}

impl ManifestEntry {
    /// Decode one manifest row
    ///
    /// A row whose fields have unexpected types still yields an entry: the
    /// id and every non-typed key are salvaged and `decode_error` carries
    /// the reason, so the failure stays attached to that row and its
    /// external id can still be derived.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<ManifestEntry>(value.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                let mut entry = ManifestEntry {
                    decode_error: Some(e.to_string()),
                    ..Default::default()
                };
                if let Value::Object(object) = value {
                    entry.id = object.get("id").and_then(scalar_to_string);
                    entry.extra = object
                        .into_iter()
                        .filter(|(key, _)| !TYPED_KEYS.contains(&key.as_str()))
                        .collect();
                }
                entry
            }
        }
    }

    /// String-valued extra field
    pub fn extra_str(&self, key: &str) -> Option<String> {
        self.extra.get(key).and_then(scalar_to_string)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, found {}",
            other
        ))),
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid size {}", n))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid size {:?}", s))),
        Some(other) => Err(D::Error::custom(format!("invalid size {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aliases_and_numeric_strings() {
        let entry = ManifestEntry::from_value(json!({
            "id": 42,
            "title": "Intro",
            "modified": "2024-01-01T00:00:00Z",
            "files": [{"name": "slides.pdf", "hash": "abc", "size": "1024", "url": "files/1"}],
            "semester": "WS"
        }));

        assert!(entry.decode_error.is_none());
        assert_eq!(entry.id.as_deref(), Some("42"));
        assert_eq!(entry.last_modified.as_deref(), Some("2024-01-01T00:00:00Z"));
        let file = &entry.files.as_ref().unwrap()[0];
        assert_eq!(file.checksum.as_deref(), Some("abc"));
        assert_eq!(file.size, Some(1024));
        assert_eq!(file.reference.as_deref(), Some("files/1"));
        assert_eq!(entry.extra_str("semester").as_deref(), Some("WS"));
    }

    #[test]
    fn test_missing_files_key_is_none() {
        let entry = ManifestEntry::from_value(json!({"id": "c1", "title": "Intro"}));
        assert!(entry.files.is_none());
        assert!(entry.extra.is_empty());
    }

    #[test]
    fn test_bad_field_type_keeps_id() {
        let entry = ManifestEntry::from_value(json!({"id": "c9", "title": ["not", "a", "string"]}));
        assert_eq!(entry.id.as_deref(), Some("c9"));
        assert!(entry.decode_error.is_some());
    }

    #[test]
    fn test_bad_field_type_keeps_extra_keys() {
        let entry = ManifestEntry::from_value(json!({
            "fileurl": "files/a.pdf",
            "contenthash": "h1",
            "title": ["A"]
        }));

        assert!(entry.decode_error.is_some());
        assert!(entry.id.is_none());
        assert!(entry.title.is_none());
        assert_eq!(entry.extra_str("fileurl").as_deref(), Some("files/a.pdf"));
        assert_eq!(entry.extra_str("contenthash").as_deref(), Some("h1"));
        assert!(!entry.extra.contains_key("title"));
    }
}

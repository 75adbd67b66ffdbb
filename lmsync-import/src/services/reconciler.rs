//! Reconciliation of incoming records against the repository index
//!
//! Pure: no I/O, no clock. Given the same index and incoming sequence the
//! same decisions come out in the same order (incoming order first, then
//! retirements sorted by external id).

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{CanonicalRecord, FileDescriptor, RecordMetadata, RecordSummary, RepositoryIndex};

/// What changed between the stored record and the incoming one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDiff {
    /// "title", "description", or `fields.<key>`
    pub changed_fields: Vec<String>,
    pub files_added: Vec<String>,
    /// Same name, different content hash
    pub files_changed: Vec<String>,
    pub files_removed: Vec<String>,
}

impl RecordDiff {
    pub fn is_empty(&self) -> bool {
        self.changed_fields.is_empty()
            && self.files_added.is_empty()
            && self.files_changed.is_empty()
            && self.files_removed.is_empty()
    }

    /// File names whose bytes must be transferred
    pub fn transfers(&self) -> Vec<&str> {
        self.files_added
            .iter()
            .chain(self.files_changed.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Classification of one incoming record or one absent repository record
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// New external id, or re-activation of a retired record
    Create {
        record: CanonicalRecord,
        /// Retired record whose identifier is reused
        reactivate: Option<RecordSummary>,
    },
    Update {
        record: CanonicalRecord,
        existing: RecordSummary,
        diff: RecordDiff,
    },
    Skip {
        external_id: String,
        existing: RecordSummary,
    },
    Retire {
        external_id: String,
        existing: RecordSummary,
    },
}

impl Decision {
    pub fn external_id(&self) -> &str {
        match self {
            Decision::Create { record, .. } | Decision::Update { record, .. } => &record.external_id,
            Decision::Skip { external_id, .. } | Decision::Retire { external_id, .. } => external_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Create { reactivate: None, .. } => "CREATE",
            Decision::Create { reactivate: Some(_), .. } => "REACTIVATE",
            Decision::Update { .. } => "UPDATE",
            Decision::Skip { .. } => "SKIP",
            Decision::Retire { .. } => "RETIRE",
        }
    }
}

/// Classify incoming records against the repository index
///
/// `incoming` must hold unique external ids (duplicates are filtered out
/// before this point). Active records absent from `incoming` are retired
/// unless listed in `protected`, the ids of rows that failed earlier in the
/// run.
pub fn reconcile(
    index: &RepositoryIndex,
    incoming: &[CanonicalRecord],
    protected: &HashSet<String>,
) -> Vec<Decision> {
    let incoming_ids: HashSet<&str> = incoming.iter().map(|r| r.external_id.as_str()).collect();
    let mut decisions = Vec::with_capacity(incoming.len());

    for record in incoming {
        decisions.push(classify(index.get(&record.external_id), record));
    }

    let mut retired: Vec<&RecordSummary> = index
        .values()
        .filter(|r| r.is_active())
        .filter(|r| !incoming_ids.contains(r.external_id.as_str()))
        .filter(|r| !protected.contains(&r.external_id))
        .collect();
    retired.sort_by(|a, b| a.external_id.cmp(&b.external_id));

    decisions.extend(retired.into_iter().map(|existing| Decision::Retire {
        external_id: existing.external_id.clone(),
        existing: existing.clone(),
    }));

    decisions
}

/// Decide what to do with one incoming record given its stored state
pub fn classify(existing: Option<&RecordSummary>, record: &CanonicalRecord) -> Decision {
    match existing {
        None => Decision::Create {
            record: record.clone(),
            reactivate: None,
        },
        Some(existing) if !existing.is_active() => Decision::Create {
            record: record.clone(),
            reactivate: Some(existing.clone()),
        },
        Some(existing) => {
            let diff = diff_record(existing, record);
            if diff.is_empty() {
                Decision::Skip {
                    external_id: record.external_id.clone(),
                    existing: existing.clone(),
                }
            } else {
                Decision::Update {
                    record: record.clone(),
                    existing: existing.clone(),
                    diff,
                }
            }
        }
    }
}

/// Compare stored and incoming state; file order is not significant
pub fn diff_record(existing: &RecordSummary, incoming: &CanonicalRecord) -> RecordDiff {
    RecordDiff {
        changed_fields: diff_metadata(&existing.metadata, &incoming.metadata),
        ..diff_files(&existing.files, &incoming.files)
    }
}

fn diff_metadata(old: &RecordMetadata, new: &RecordMetadata) -> Vec<String> {
    let mut changed = Vec::new();

    if old.title != new.title {
        changed.push("title".to_string());
    }
    if old.description != new.description {
        changed.push("description".to_string());
    }

    let keys: std::collections::BTreeSet<&String> = old.fields.keys().chain(new.fields.keys()).collect();
    for key in keys {
        if old.fields.get(key) != new.fields.get(key) {
            changed.push(format!("fields.{}", key));
        }
    }

    changed
}

fn diff_files(old: &[FileDescriptor], new: &[FileDescriptor]) -> RecordDiff {
    let old_by_name: HashMap<&str, &str> = old
        .iter()
        .map(|f| (f.name.as_str(), f.content_hash.as_str()))
        .collect();
    let new_by_name: BTreeMap<&str, &str> = new
        .iter()
        .map(|f| (f.name.as_str(), f.content_hash.as_str()))
        .collect();

    let mut diff = RecordDiff::default();

    for (name, hash) in &new_by_name {
        match old_by_name.get(name) {
            None => diff.files_added.push(name.to_string()),
            Some(old_hash) if old_hash != hash => diff.files_changed.push(name.to_string()),
            Some(_) => {}
        }
    }

    let mut removed: Vec<String> = old_by_name
        .keys()
        .filter(|name| !new_by_name.contains_key(*name))
        .map(|name| name.to_string())
        .collect();
    removed.sort();
    diff.files_removed = removed;

    diff
}

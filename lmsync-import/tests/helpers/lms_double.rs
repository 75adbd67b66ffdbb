//! Scripted in-process LMS
//!
//! Serves a manifest and file bodies from memory, with injectable failures
//! and an optional gate that holds the manifest fetch open.

use async_trait::async_trait;
use lmsync_import::models::ManifestEntry;
use lmsync_import::services::{FetchError, LmsSource, StagedFile};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// `sha256:<hex>` of `bytes`
pub fn sha256_of(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}

/// Generic manifest entry with one file per `(name, hash)` pair
pub fn entry(id: &str, title: &str, files: &[(&str, &str)]) -> Value {
    let files: Vec<Value> = files
        .iter()
        .map(|(name, hash)| json!({"name": name, "hash": hash, "url": format!("files/{}", name)}))
        .collect();
    json!({"id": id, "title": title, "files": files})
}

/// Manifest file without checksum; the content is hashed during staging
pub fn file_entry(name: &str) -> Value {
    json!({"name": name, "url": format!("files/{}", name)})
}

#[derive(Default)]
pub struct ScriptedLms {
    manifest: Mutex<Vec<Value>>,
    manifest_failures: Mutex<VecDeque<FetchError>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    file_failures: Mutex<HashMap<String, FetchError>>,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    manifest_calls: AtomicUsize,
    file_calls: AtomicUsize,
}

impl ScriptedLms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_manifest(&self, entries: Vec<Value>) {
        *self.manifest.lock().unwrap() = entries;
    }

    /// Fail the next manifest fetches with `errors`, in order
    pub fn fail_manifest(&self, errors: Vec<FetchError>) {
        self.manifest_failures.lock().unwrap().extend(errors);
    }

    /// Serve `bytes` for reference `files/<name>`
    pub fn add_file(&self, name: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(format!("files/{}", name), bytes.to_vec());
    }

    /// Every download of `files/<name>` fails with `error`
    pub fn fail_file(&self, name: &str, error: FetchError) {
        self.file_failures
            .lock()
            .unwrap()
            .insert(format!("files/{}", name), error);
    }

    /// Hold the next manifest fetch until `release` is notified
    ///
    /// Returns (entered, release).
    pub fn hold_manifest(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub fn manifest_calls(&self) -> usize {
        self.manifest_calls.load(Ordering::SeqCst)
    }

    pub fn file_calls(&self) -> usize {
        self.file_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LmsSource for ScriptedLms {
    async fn fetch_manifest(&self) -> Result<Vec<ManifestEntry>, FetchError> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        if let Some(error) = self.manifest_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let entries = self.manifest.lock().unwrap().clone();
        Ok(entries.into_iter().map(ManifestEntry::from_value).collect())
    }

    async fn fetch_file(&self, reference: &str, dest: &Path) -> Result<StagedFile, FetchError> {
        self.file_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.file_failures.lock().unwrap().get(reference) {
            return Err(error.clone());
        }

        let bytes = self
            .files
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(reference.to_string()))?;

        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        Ok(StagedFile {
            path: dest.to_path_buf(),
            content_hash: sha256_of(&bytes),
            size: bytes.len() as u64,
        })
    }
}

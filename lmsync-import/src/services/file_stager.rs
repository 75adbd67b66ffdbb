//! Run-scoped file staging
//!
//! Downloads LMS files into a temporary directory owned by one run, keyed
//! by download reference so each file is fetched at most once per run. The
//! directory is removed when the stager is dropped.
//!
//! References listed in the local-file map are hashed from disk and never
//! downloaded.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::models::{FileDescriptor, ManifestEntry};
use crate::services::lms_client::{FetchError, LmsSource, StagedFile, SHA256_PREFIX};
use crate::utils::{retry_transient, RetryPolicy};

pub struct FileStager {
    source: Arc<dyn LmsSource>,
    retry: RetryPolicy,
    dir: TempDir,
    local_files: HashMap<String, PathBuf>,
    staged: Mutex<HashMap<String, StagedFile>>,
}

impl FileStager {
    pub fn new(source: Arc<dyn LmsSource>, retry: RetryPolicy) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("lmsync-stage-").tempdir()?;
        tracing::debug!(dir = %dir.path().display(), "Staging directory created");

        Ok(Self {
            source,
            retry,
            dir,
            local_files: HashMap::new(),
            staged: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_local_files(mut self, local_files: HashMap<String, PathBuf>) -> Self {
        self.local_files = local_files;
        self
    }

    /// Download `reference` unless already staged in this run
    pub async fn stage(&self, reference: &str) -> Result<StagedFile, FetchError> {
        if let Some(staged) = self.staged.lock().await.get(reference) {
            return Ok(staged.clone());
        }

        let staged = match self.local_files.get(reference) {
            Some(path) => hash_local_file(path).await?,
            None => {
                let dest = {
                    let staged = self.staged.lock().await;
                    self.dir.path().join(format!("{:06}", staged.len()))
                };

                retry_transient("fetch_file", &self.retry, || {
                    self.source.fetch_file(reference, &dest)
                })
                .await?
            }
        };

        self.staged
            .lock()
            .await
            .insert(reference.to_string(), staged.clone());

        Ok(staged)
    }

    /// Fill in checksum and size for files the manifest left without a hash
    pub async fn fill_missing_checksums(&self, entry: &mut ManifestEntry) -> Result<(), FetchError> {
        let Some(files) = entry.files.as_mut() else {
            return Ok(());
        };

        for file in files.iter_mut() {
            let has_checksum = file.checksum.as_deref().is_some_and(|c| !c.trim().is_empty());
            if has_checksum {
                continue;
            }
            // A file without reference is reported by the normalizer
            let Some(reference) = file.reference.clone().filter(|r| !r.trim().is_empty()) else {
                continue;
            };

            let staged = self.stage(&reference).await?;
            file.checksum = Some(staged.content_hash);
            if file.size.is_none() {
                file.size = Some(staged.size);
            }
        }

        Ok(())
    }

    /// Bytes of a file, downloading it on demand
    ///
    /// Locally computed hashes are verified; opaque LMS hashes are trusted.
    pub async fn read(&self, descriptor: &FileDescriptor) -> Result<Vec<u8>, FetchError> {
        let staged = self.stage(&descriptor.reference).await?;

        if descriptor.content_hash.starts_with(SHA256_PREFIX) && staged.content_hash != descriptor.content_hash {
            return Err(FetchError::Malformed(format!(
                "content of {} changed during the run (expected {}, got {})",
                descriptor.name, descriptor.content_hash, staged.content_hash
            )));
        }

        tokio::fs::read(&staged.path)
            .await
            .map_err(|e| FetchError::Transient(format!("read staged {}: {}", staged.path.display(), e)))
    }

    /// Number of distinct files downloaded so far
    pub async fn staged_count(&self) -> usize {
        self.staged.lock().await.len()
    }
}

/// Hash a file provided on disk
async fn hash_local_file(path: &Path) -> Result<StagedFile, FetchError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FetchError::NotFound(path.display().to_string()),
        _ => FetchError::Transient(format!("open {}: {}", path.display(), e)),
    })?;

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| FetchError::Transient(format!("read {}: {}", path.display(), e)))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    let content_hash = format!("{}{:x}", SHA256_PREFIX, hasher.finalize());
    tracing::debug!(path = %path.display(), size, hash = %content_hash, "Local file staged");

    Ok(StagedFile {
        path: path.to_path_buf(),
        content_hash,
        size,
    })
}

//! LMS API client
//!
//! Fetches the complete manifest (following pagination internally) and
//! streams file payloads to a staging path while hashing them. Retries are
//! left to the caller; every request is bounded by the configured timeouts
//! and spaced by a rate limiter.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::LmsConfig;
use crate::models::ManifestEntry;
use crate::utils::Retryable;

const USER_AGENT: &str = concat!("lmsync/", env!("CARGO_PKG_VERSION"));

/// Prefix of content hashes computed locally
pub const SHA256_PREFIX: &str = "sha256:";

/// LMS client errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, 5xx, connection resets; another attempt may succeed
    #[error("Transient fetch error: {0}")]
    Transient(String),

    /// Credentials rejected (401/403)
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Response cannot be trusted or decoded
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Referenced file does not exist (404/410)
    #[error("File not found: {0}")]
    NotFound(String),
}

impl FetchError {
    /// Machine-readable code for run reports
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Transient(_) => "TRANSIENT_FETCH_ERROR",
            FetchError::Auth(_) => "AUTH_ERROR",
            FetchError::Malformed(_) => "MALFORMED_RESPONSE",
            FetchError::NotFound(_) => "NOT_FOUND",
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// A file downloaded to local staging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    /// `sha256:<hex>` of the downloaded bytes
    pub content_hash: String,
    pub size: u64,
}

/// Source of manifests and file payloads
#[async_trait]
pub trait LmsSource: Send + Sync {
    /// Fetch the complete manifest, all pages
    async fn fetch_manifest(&self) -> Result<Vec<ManifestEntry>, FetchError>;

    /// Download `reference` to `dest`, returning its hash and size
    async fn fetch_file(&self, reference: &str, dest: &Path) -> Result<StagedFile, FetchError>;
}

/// Rate limiter enforcing a minimum interval between requests
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    /// Wait if necessary to comply with rate limit
    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

/// HTTP client for the LMS manifest and file endpoints
pub struct LmsClient {
    http_client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
    max_pages: usize,
    rate_limiter: Arc<RateLimiter>,
}

impl LmsClient {
    pub fn new(config: &LmsConfig) -> Result<Self, FetchError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| FetchError::Malformed(format!("invalid endpoint {}: {}", config.endpoint, e)))?;

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint,
            token: config.token.clone(),
            max_pages: config.max_pages.max(1),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
        })
    }

    /// Resolve a page or file reference against the endpoint
    fn resolve(&self, base: &Url, reference: &str) -> Result<Url, FetchError> {
        base.join(reference)
            .map_err(|e| FetchError::Malformed(format!("invalid reference {}: {}", reference, e)))
    }

    async fn get(&self, url: Url, for_file: bool) -> Result<reqwest::Response, FetchError> {
        self.rate_limiter.wait().await;

        tracing::debug!(url = %url, "LMS request");

        let mut request = self.http_client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        Err(classify_status(status, url.as_str(), for_file))
    }

    async fn fetch_page(&self, url: Url) -> Result<(Vec<ManifestEntry>, Option<String>), FetchError> {
        let response = self.get(url.clone(), false).await?;
        let body = response.bytes().await.map_err(transport_error)?;

        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(format!("manifest page {} is not JSON: {}", url, e)))?;

        parse_manifest_page(value)
    }
}

#[async_trait]
impl LmsSource for LmsClient {
    async fn fetch_manifest(&self) -> Result<Vec<ManifestEntry>, FetchError> {
        let mut url = self.endpoint.clone();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        loop {
            if !seen.insert(url.to_string()) {
                return Err(FetchError::Malformed(format!(
                    "pagination revisits page {}",
                    url
                )));
            }
            if seen.len() > self.max_pages {
                return Err(FetchError::Malformed(format!(
                    "manifest exceeds {} pages",
                    self.max_pages
                )));
            }

            let (page, next) = self.fetch_page(url.clone()).await?;
            tracing::debug!(page = seen.len(), entries = page.len(), "Manifest page fetched");
            entries.extend(page);

            match next {
                Some(next) => url = self.resolve(&url, &next)?,
                None => break,
            }
        }

        tracing::info!(entries = entries.len(), pages = seen.len(), "Manifest fetched");
        Ok(entries)
    }

    async fn fetch_file(&self, reference: &str, dest: &Path) -> Result<StagedFile, FetchError> {
        let url = self.resolve(&self.endpoint, reference)?;
        let response = self.get(url.clone(), true).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FetchError::Transient(format!("create {}: {}", dest.display(), e)))?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_error)?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Transient(format!("write {}: {}", dest.display(), e)))?;
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Transient(format!("flush {}: {}", dest.display(), e)))?;

        let content_hash = format!("{}{:x}", SHA256_PREFIX, hasher.finalize());
        tracing::debug!(url = %url, size, hash = %content_hash, "File staged");

        Ok(StagedFile {
            path: dest.to_path_buf(),
            content_hash,
            size,
        })
    }
}

/// Map a transport-level failure (no usable HTTP status)
fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Malformed(err.to_string())
    } else if err.is_timeout() {
        FetchError::Transient(format!("timeout: {}", err))
    } else {
        FetchError::Transient(err.to_string())
    }
}

/// Map a non-success HTTP status to the fetch error taxonomy
pub fn classify_status(status: StatusCode, url: &str, for_file: bool) -> FetchError {
    match status.as_u16() {
        401 | 403 => FetchError::Auth(format!("HTTP {} from {}", status.as_u16(), url)),
        408 | 429 => FetchError::Transient(format!("HTTP {} from {}", status.as_u16(), url)),
        code if (500..600).contains(&code) => {
            FetchError::Transient(format!("HTTP {} from {}", code, url))
        }
        404 | 410 if for_file => FetchError::NotFound(url.to_string()),
        code => FetchError::Malformed(format!("unexpected HTTP {} from {}", code, url)),
    }
}

/// Split one manifest page into entries and the `next` link
///
/// Accepts `{"entries": [...], "next": ...}`, the Moodle envelope
/// `{"moodlecourses": {"<key>": {"files": [...]}}, "next": ...}`, or a bare
/// array of entries.
pub fn parse_manifest_page(value: Value) -> Result<(Vec<ManifestEntry>, Option<String>), FetchError> {
    let object = match value {
        Value::Array(items) => return Ok((entries_from_array(items)?, None)),
        Value::Object(object) => object,
        other => {
            return Err(FetchError::Malformed(format!(
                "manifest page must be an object, got {}",
                json_type(&other)
            )))
        }
    };

    let next = match object.get("next") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(FetchError::Malformed(format!(
                "next must be a URL string, got {}",
                json_type(other)
            )))
        }
    };

    if let Some(entries) = object.get("entries") {
        let Value::Array(items) = entries else {
            return Err(FetchError::Malformed("entries must be an array".to_string()));
        };
        return Ok((entries_from_array(items.clone())?, next));
    }

    if let Some(courses) = object.get("moodlecourses") {
        let Value::Object(courses) = courses else {
            return Err(FetchError::Malformed("moodlecourses must be an object".to_string()));
        };

        let mut entries = Vec::new();
        for (key, course) in courses {
            match course.get("files") {
                None | Some(Value::Null) => {}
                Some(Value::Array(files)) => entries.extend(entries_from_array(files.clone())?),
                Some(_) => {
                    return Err(FetchError::Malformed(format!(
                        "moodlecourses.{}.files must be an array",
                        key
                    )))
                }
            }
        }
        return Ok((entries, next));
    }

    Err(FetchError::Malformed(
        "manifest page has neither entries nor moodlecourses".to_string(),
    ))
}

fn entries_from_array(items: Vec<Value>) -> Result<Vec<ManifestEntry>, FetchError> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(_) => Ok(ManifestEntry::from_value(item)),
            other => Err(FetchError::Malformed(format!(
                "manifest entry {} must be an object, got {}",
                i,
                json_type(&other)
            ))),
        })
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

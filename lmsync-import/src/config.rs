//! Configuration resolution for lmsync-import
//!
//! Builds the explicit [`LmsConfig`] value handed to the LMS client.
//! Endpoint and token use multi-tier resolution with Database → ENV → TOML
//! priority; tuning knobs come from the TOML `[lms]` section or defaults.

use crate::db::settings;
use crate::utils::RetryPolicy;
use lmsync_common::config::TomlConfig;
use lmsync_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const ENDPOINT_ENV_VAR: &str = "LMSYNC_LMS_ENDPOINT";
pub const TOKEN_ENV_VAR: &str = "LMSYNC_LMS_TOKEN";

/// Module name used for the TOML file (`lmsync/lmsync-import.toml`)
pub const MODULE_NAME: &str = "lmsync-import";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RATE_LIMIT_MS: u64 = 200;
const DEFAULT_MAX_PAGES: usize = 1000;
const DEFAULT_LOCK_TTL_SECS: u64 = 6 * 60 * 60;

/// Manifest schema variant, selects the normalizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaProfile {
    #[default]
    Generic,
    Moodle,
}

impl FromStr for SchemaProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" => Ok(SchemaProfile::Generic),
            "moodle" => Ok(SchemaProfile::Moodle),
            other => Err(Error::Config(format!(
                "Unknown schema profile '{}' (expected 'generic' or 'moodle')",
                other
            ))),
        }
    }
}

/// Everything the LMS client needs, fixed at construction
#[derive(Debug, Clone)]
pub struct LmsConfig {
    /// Manifest listing URL
    pub endpoint: String,
    /// Bearer token; requests are unauthenticated when absent
    pub token: Option<String>,
    pub schema_profile: SchemaProfile,
    /// Applies to every request, including each page and each download
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Minimum interval between two requests
    pub rate_limit: Duration,
    /// Upper bound on manifest pages per fetch
    pub max_pages: usize,
    /// Download references served from local paths instead of the LMS
    pub local_files: HashMap<String, PathBuf>,
}

impl LmsConfig {
    /// Configuration with default tuning for `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            schema_profile: SchemaProfile::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            rate_limit: Duration::from_millis(DEFAULT_RATE_LIMIT_MS),
            max_pages: DEFAULT_MAX_PAGES,
            local_files: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_schema_profile(mut self, profile: SchemaProfile) -> Self {
        self.schema_profile = profile;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_local_files(mut self, local_files: HashMap<String, PathBuf>) -> Self {
        self.local_files = local_files;
        self
    }
}

/// Run-level settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// A held lock older than this is treated as abandoned
    pub lock_ttl: Duration,
    /// Notified with the report of every FAILED run
    pub failure_webhook: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            failure_webhook: None,
        }
    }
}

impl RunConfig {
    pub fn from_toml(toml_config: &TomlConfig) -> Self {
        Self {
            lock_ttl: toml_config
                .run
                .lock_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| RunConfig::default().lock_ttl),
            failure_webhook: toml_config
                .run
                .failure_webhook
                .clone()
                .filter(|url| is_valid_value(url)),
        }
    }
}

/// Validate a configured value (non-empty, non-whitespace)
pub fn is_valid_value(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Pick the highest-priority valid value among database, environment and TOML
///
/// Logs a warning when more than one tier carries a value.
fn resolve_tiered(
    name: &str,
    db_value: Option<String>,
    env_value: Option<String>,
    toml_value: Option<String>,
) -> Option<String> {
    let tiers = [
        ("database", db_value),
        ("environment", env_value),
        ("TOML", toml_value),
    ];

    let present: Vec<(&str, String)> = tiers
        .into_iter()
        .filter_map(|(source, value)| value.filter(|v| is_valid_value(v)).map(|v| (source, v)))
        .collect();

    if present.len() > 1 {
        let sources: Vec<&str> = present.iter().map(|(source, _)| *source).collect();
        warn!(
            "{} found in multiple sources: {}. Using {} (highest priority).",
            name,
            sources.join(", "),
            sources[0]
        );
    }

    present.into_iter().next().map(|(source, value)| {
        info!("{} loaded from {}", name, source);
        value
    })
}

/// Resolve LMS endpoint from 3-tier configuration
///
/// **Priority:** Database → ENV → TOML
pub async fn resolve_lms_endpoint(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<String> {
    let db_value = settings::get_lms_endpoint(db).await?;
    let env_value = std::env::var(ENDPOINT_ENV_VAR).ok();
    let toml_value = toml_config.lms.endpoint.clone();

    let endpoint = resolve_tiered("LMS endpoint", db_value, env_value, toml_value).ok_or_else(|| {
        Error::Config(format!(
            "LMS endpoint not configured. Please configure using one of:\n\
             1. Database setting: {}\n\
             2. Environment: {}=https://lms.example.org/manifest\n\
             3. TOML config: ~/.config/lmsync/{}.toml ([lms] endpoint = \"...\")",
            settings::LMS_ENDPOINT_KEY,
            ENDPOINT_ENV_VAR,
            MODULE_NAME
        ))
    })?;

    let endpoint = endpoint.trim().to_string();
    let url = reqwest::Url::parse(&endpoint)
        .map_err(|e| Error::Config(format!("Invalid LMS endpoint '{}': {}", endpoint, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "LMS endpoint must use http or https: {}",
            endpoint
        )));
    }

    Ok(endpoint)
}

/// Resolve LMS bearer token; absent everywhere means unauthenticated requests
pub async fn resolve_lms_token(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<Option<String>> {
    let db_value = settings::get_lms_token(db).await?;
    let env_value = std::env::var(TOKEN_ENV_VAR).ok();
    let toml_value = toml_config.lms.token.clone();

    Ok(resolve_tiered("LMS token", db_value, env_value, toml_value).map(|t| t.trim().to_string()))
}

/// Build the full LMS client configuration
pub async fn load_lms_config(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<LmsConfig> {
    let endpoint = resolve_lms_endpoint(db, toml_config).await?;
    let token = resolve_lms_token(db, toml_config).await?;
    let lms = &toml_config.lms;

    let schema_profile = match &lms.schema_profile {
        Some(profile) => profile.parse()?,
        None => SchemaProfile::default(),
    };

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        max_attempts: lms.max_attempts.unwrap_or(defaults.max_attempts).max(1),
        initial_backoff: lms
            .initial_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_backoff),
        max_backoff: defaults.max_backoff,
    };

    let mut config = LmsConfig::new(endpoint)
        .with_token(token)
        .with_schema_profile(schema_profile)
        .with_retry(retry)
        .with_local_files(lms.local_files.clone().into_iter().collect());

    if let Some(secs) = lms.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = lms.connect_timeout_secs {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = lms.rate_limit_ms {
        config.rate_limit = Duration::from_millis(ms);
    }
    if let Some(pages) = lms.max_pages {
        config.max_pages = pages.max(1);
    }

    info!(
        endpoint = %config.endpoint,
        profile = ?config.schema_profile,
        authenticated = config.token.is_some(),
        local_files = config.local_files.len(),
        "LMS configuration resolved"
    );

    Ok(config)
}

// ============================================================================
// Settings Sync and Write-Back
// ============================================================================

/// Sync settings from database to TOML file
///
/// HashMap keys: "lms_endpoint", "lms_token"
pub async fn sync_settings_to_toml(values: HashMap<String, String>, toml_path: &Path) -> Result<()> {
    let mut config = lmsync_common::config::load_toml_config(toml_path)?;

    if let Some(endpoint) = values.get(settings::LMS_ENDPOINT_KEY) {
        config.lms.endpoint = Some(endpoint.clone());
    }
    if let Some(token) = values.get(settings::LMS_TOKEN_KEY) {
        config.lms.token = Some(token.clone());
    }

    // Best-effort: the database already holds the authoritative value
    match lmsync_common::config::write_toml_config(&config, toml_path) {
        Ok(()) => {
            info!("Settings synced to TOML: {}", toml_path.display());
            Ok(())
        }
        Err(e) => {
            warn!("TOML write failed (database write succeeded): {}", e);
            Ok(())
        }
    }
}

/// Store the LMS endpoint in the database and mirror it to TOML
pub async fn save_lms_endpoint(db: &Pool<Sqlite>, endpoint: String, toml_path: &Path) -> Result<()> {
    settings::set_lms_endpoint(db, endpoint.clone()).await?;

    let mut synced = HashMap::new();
    synced.insert(settings::LMS_ENDPOINT_KEY.to_string(), endpoint);
    sync_settings_to_toml(synced, toml_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_profile_parse() {
        assert_eq!("Moodle".parse::<SchemaProfile>().unwrap(), SchemaProfile::Moodle);
        assert_eq!(" generic ".parse::<SchemaProfile>().unwrap(), SchemaProfile::Generic);
        assert!("blackboard".parse::<SchemaProfile>().is_err());
    }

    #[test]
    fn test_is_valid_value() {
        assert!(is_valid_value("https://lms"));
        assert!(!is_valid_value(""));
        assert!(!is_valid_value("   "));
    }

    #[test]
    fn test_resolve_tiered_priority() {
        let value = resolve_tiered(
            "test",
            Some("db".to_string()),
            Some("env".to_string()),
            Some("toml".to_string()),
        );
        assert_eq!(value.as_deref(), Some("db"));

        let value = resolve_tiered("test", Some("  ".to_string()), None, Some("toml".to_string()));
        assert_eq!(value.as_deref(), Some("toml"));

        assert!(resolve_tiered("test", None, None, None).is_none());
    }

    #[test]
    fn test_run_config_from_toml() {
        let mut toml_config = TomlConfig::default();
        assert_eq!(RunConfig::from_toml(&toml_config), RunConfig::default());

        toml_config.run.lock_ttl_secs = Some(60);
        assert_eq!(
            RunConfig::from_toml(&toml_config).lock_ttl,
            Duration::from_secs(60)
        );

        toml_config.run.failure_webhook = Some("  ".to_string());
        assert_eq!(RunConfig::from_toml(&toml_config).failure_webhook, None);

        toml_config.run.failure_webhook = Some("https://ops.example.org/hook".to_string());
        assert_eq!(
            RunConfig::from_toml(&toml_config).failure_webhook.as_deref(),
            Some("https://ops.example.org/hook")
        );
    }
}

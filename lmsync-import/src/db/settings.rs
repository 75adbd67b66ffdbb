//! Settings database operations
//!
//! Key/value accessors for the `settings` table, the highest-priority
//! configuration tier.

use lmsync_common::{Error, Result};
use sqlx::{Pool, Sqlite};

pub const LMS_ENDPOINT_KEY: &str = "lms_endpoint";
pub const LMS_TOKEN_KEY: &str = "lms_token";

/// Get LMS manifest endpoint from database
pub async fn get_lms_endpoint(db: &Pool<Sqlite>) -> Result<Option<String>> {
    get_setting::<String>(db, LMS_ENDPOINT_KEY).await
}

pub async fn set_lms_endpoint(db: &Pool<Sqlite>, endpoint: String) -> Result<()> {
    set_setting(db, LMS_ENDPOINT_KEY, endpoint).await
}

/// Get LMS bearer token from database
pub async fn get_lms_token(db: &Pool<Sqlite>) -> Result<Option<String>> {
    get_setting::<String>(db, LMS_TOKEN_KEY).await
}

pub async fn set_lms_token(db: &Pool<Sqlite>, token: String) -> Result<()> {
    set_setting(db, LMS_TOKEN_KEY, token).await
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((Some(value),)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

/// Generic setting setter (upsert)
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

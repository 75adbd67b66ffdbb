//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up to
//! date. Every `create_*` function is idempotent and safe to call on an
//! existing database.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every pooled connection
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
///
/// Foreign keys, WAL and the busy timeout are set through the connect
/// options so that every pooled connection carries them.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        // WAL lets the HTTP surface read run history while a run writes
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table used by lmsync
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_records_table(pool).await?;
    create_record_versions_table(pool).await?;
    create_blobs_table(pool).await?;
    create_record_files_table(pool).await?;
    create_import_runs_table(pool).await?;
    create_run_locks_table(pool).await?;

    info!("Database schema ready");
    Ok(())
}

/// Key/value settings (highest-priority configuration tier)
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One row per repository record; `external_id` is the LMS cross-reference
pub async fn create_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            record_id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL CHECK (status IN ('active', 'retired')),
            current_version INTEGER NOT NULL CHECK (current_version >= 1),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_status ON records(status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Immutable metadata snapshots, one per record version
pub async fn create_record_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_versions (
            record_id TEXT NOT NULL REFERENCES records(record_id),
            version INTEGER NOT NULL,
            metadata TEXT NOT NULL,
            source_modified_at TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (record_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Content-addressed file payloads
pub async fn create_blobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blobs (
            content_hash TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            content BLOB NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Files attached to a record version
pub async fn create_record_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_files (
            record_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            content_hash TEXT NOT NULL REFERENCES blobs(content_hash),
            size INTEGER,
            reference TEXT NOT NULL,
            PRIMARY KEY (record_id, version, name),
            FOREIGN KEY (record_id, version) REFERENCES record_versions(record_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Run history with the serialized run report
pub async fn create_import_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_runs (
            run_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            report TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Run-scoped lock rows, keyed by lock name
pub async fn create_run_locks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_locks (
            lock_name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

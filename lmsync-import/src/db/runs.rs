//! Run lock and run history persistence
//!
//! The run lock is one row in `run_locks`. Acquisition is a single insert,
//! so two processes sharing the database can never both hold it.

use chrono::{DateTime, SecondsFormat, Utc};
use lmsync_common::events::RunState;
use lmsync_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::RunReport;

/// Name of the lock row guarding import runs
pub const IMPORT_LOCK_NAME: &str = "import";

/// Fixed-width timestamp so that stored values compare as strings
fn lock_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Try to take the import lock for `run_id`
///
/// Returns `false` without waiting when another run holds it. Locks older
/// than `ttl` belong to crashed processes and are broken first.
pub async fn acquire_run_lock(pool: &SqlitePool, run_id: Uuid, ttl: Duration) -> Result<bool> {
    let now = Utc::now();
    let max_age = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Config(format!("Lock TTL out of range: {}", e)))?;
    let cutoff = lock_timestamp(now - max_age);

    let broken = sqlx::query("DELETE FROM run_locks WHERE lock_name = ? AND acquired_at < ?")
        .bind(IMPORT_LOCK_NAME)
        .bind(&cutoff)
        .execute(pool)
        .await?;
    if broken.rows_affected() > 0 {
        tracing::warn!(run_id = %run_id, "Broke abandoned run lock older than {:?}", ttl);
    }

    let inserted = sqlx::query(
        "INSERT INTO run_locks (lock_name, holder, acquired_at) VALUES (?, ?, ?)
         ON CONFLICT(lock_name) DO NOTHING",
    )
    .bind(IMPORT_LOCK_NAME)
    .bind(run_id.to_string())
    .bind(lock_timestamp(now))
    .execute(pool)
    .await?;

    let acquired = inserted.rows_affected() == 1;
    tracing::debug!(run_id = %run_id, acquired, "Run lock acquisition");
    Ok(acquired)
}

/// Release the import lock if `run_id` still holds it
pub async fn release_run_lock(pool: &SqlitePool, run_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM run_locks WHERE lock_name = ? AND holder = ?")
        .bind(IMPORT_LOCK_NAME)
        .bind(run_id.to_string())
        .execute(pool)
        .await?;

    tracing::debug!(run_id = %run_id, "Run lock released");
    Ok(())
}

/// Renew the lock timestamp of `run_id` so it is not taken for abandoned
///
/// Returns `false` when `run_id` no longer holds the lock.
pub async fn refresh_run_lock(pool: &SqlitePool, run_id: Uuid) -> Result<bool> {
    let refreshed = sqlx::query("UPDATE run_locks SET acquired_at = ? WHERE lock_name = ? AND holder = ?")
        .bind(lock_timestamp(Utc::now()))
        .bind(IMPORT_LOCK_NAME)
        .bind(run_id.to_string())
        .execute(pool)
        .await?;

    Ok(refreshed.rows_affected() == 1)
}

/// Holder of the import lock, if any
pub async fn current_lock_holder(pool: &SqlitePool) -> Result<Option<Uuid>> {
    let holder: Option<String> = sqlx::query_scalar("SELECT holder FROM run_locks WHERE lock_name = ?")
        .bind(IMPORT_LOCK_NAME)
        .fetch_optional(pool)
        .await?;

    holder
        .map(|h| Uuid::parse_str(&h).map_err(|e| Error::Internal(format!("Corrupt lock holder {}: {}", h, e))))
        .transpose()
}

/// Insert or update the persisted report of a run
pub async fn save_run(pool: &SqlitePool, report: &RunReport) -> Result<()> {
    let report_json = serde_json::to_string(report)?;

    sqlx::query(
        r#"
        INSERT INTO import_runs (run_id, state, started_at, ended_at, report)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET
            state = excluded.state,
            ended_at = excluded.ended_at,
            report = excluded.report
        "#,
    )
    .bind(report.run_id.to_string())
    .bind(report.state.as_str())
    .bind(lock_timestamp(report.started_at))
    .bind(report.ended_at.map(lock_timestamp))
    .bind(&report_json)
    .execute(pool)
    .await?;

    Ok(())
}

fn report_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunReport> {
    let report: String = row.try_get("report")?;
    Ok(serde_json::from_str(&report)?)
}

/// Load one run report
pub async fn load_run(pool: &SqlitePool, run_id: Uuid) -> Result<Option<RunReport>> {
    let row = sqlx::query("SELECT report FROM import_runs WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(report_from_row).transpose()
}

/// Most recently started run
pub async fn load_latest_run(pool: &SqlitePool) -> Result<Option<RunReport>> {
    let row = sqlx::query("SELECT report FROM import_runs ORDER BY started_at DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(report_from_row).transpose()
}

/// Mark runs left non-terminal by a crashed process as FAILED
///
/// The run currently holding the lock is left alone, since another process
/// may still be executing it. Returns the number of runs marked.
pub async fn cleanup_stale_runs(pool: &SqlitePool) -> Result<usize> {
    let holder = current_lock_holder(pool).await?;

    let rows = sqlx::query("SELECT report FROM import_runs WHERE state NOT IN (?, ?, ?)")
        .bind(RunState::Completed.as_str())
        .bind(RunState::Failed.as_str())
        .bind(RunState::Cancelled.as_str())
        .fetch_all(pool)
        .await?;

    let mut cleaned = 0;
    for row in &rows {
        let mut report = report_from_row(row)?;
        if Some(report.run_id) == holder {
            continue;
        }
        report.fail("Run interrupted by process shutdown".to_string());
        save_run(pool, &report).await?;
        tracing::warn!(run_id = %report.run_id, "Marked interrupted run as FAILED");
        cleaned += 1;
    }

    Ok(cleaned)
}

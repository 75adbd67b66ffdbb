//! Database Test Utilities

use lmsync_common::db::init_database;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

/// Create a temporary database with the full schema
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("lmsync.db")).await.unwrap();
    (temp_dir, pool)
}

/// Stored state of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub record_id: String,
    pub status: String,
    pub version: i64,
}

pub async fn record_row(pool: &SqlitePool, external_id: &str) -> Option<RecordRow> {
    sqlx::query("SELECT record_id, status, current_version FROM records WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await
        .unwrap()
        .map(|row| RecordRow {
            record_id: row.get("record_id"),
            status: row.get("status"),
            version: row.get("current_version"),
        })
}

/// Sorted external ids of active records
pub async fn active_external_ids(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT external_id FROM records WHERE status = 'active' ORDER BY external_id")
        .fetch_all(pool)
        .await
        .unwrap()
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

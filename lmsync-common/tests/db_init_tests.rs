//! Database initialization tests
//!
//! - Database file is created on first run
//! - Reopening an existing database keeps its data
//! - Every table exists and constraints are enforced on pooled connections

use lmsync_common::db::init_database;
use tempfile::TempDir;

const TABLES: &[&str] = &[
    "settings",
    "records",
    "record_versions",
    "blobs",
    "record_files",
    "import_runs",
    "run_locks",
];

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("lmsync.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_all_tables_created() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("lmsync.db")).await.unwrap();

    for table in TABLES {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1, "table {} missing", table);
    }
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("lmsync.db");

    let pool1 = init_database(&db_path).await.unwrap();
    sqlx::query("INSERT INTO settings (key, value) VALUES ('lms_endpoint', 'https://lms')")
        .execute(&pool1)
        .await
        .unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await.unwrap();
    let value: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = 'lms_endpoint'")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(value, "https://lms");
}

#[tokio::test]
async fn test_record_status_constraint() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("lmsync.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO records (record_id, external_id, status, current_version, created_at, updated_at)
         VALUES ('r1', 'lms:c1', 'deleted', 1, 'now', 'now')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err(), "status outside active/retired must be rejected");
}

#[tokio::test]
async fn test_foreign_keys_enforced_on_every_connection() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("lmsync.db")).await.unwrap();

    // Hold several connections so the insert may land on any of them
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }

    for conn in held.iter_mut() {
        let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut **conn)
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    let result = sqlx::query(
        "INSERT INTO record_versions (record_id, version, metadata, created_at)
         VALUES ('missing', 1, '{}', 'now')",
    )
    .execute(&mut *held[0])
    .await;
    assert!(result.is_err(), "version row without record must be rejected");
}

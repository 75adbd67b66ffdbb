//! Database access for lmsync-import

pub mod records;
pub mod runs;
pub mod settings;

use lmsync_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (or create) the shared database and mark interrupted runs
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::debug!("Opening database: {}", db_path.display());
    let pool = lmsync_common::db::init_database(db_path).await?;

    let cleaned = runs::cleanup_stale_runs(&pool).await?;
    if cleaned > 0 {
        tracing::warn!(runs = cleaned, "Interrupted runs from a previous process marked FAILED");
    }

    Ok(pool)
}

use sqlx::SqlitePool;

use crate::error::SyncResult;

/// Create the state table if it does not exist yet.
pub async fn run_migrations(pool: &SqlitePool) -> SyncResult<()> {
    // One row per persisted state record (identity mappings, content hashes).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

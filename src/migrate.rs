use sqlx::SqlitePool;

use crate::error::RagResult;

/// Create the keyed-storage schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> RagResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_store (
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

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per committed project; hash/size/count/updated_at change together.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            name TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            file_count INTEGER NOT NULL,
            total_bytes INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Empty file_path is the project-level description.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_descriptions (
            project_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            description TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (project_name, file_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_descriptions_project ON file_descriptions(project_name)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

//! Project registry: name → last committed fingerprint.
//!
//! The registry is the source of truth for change detection. It is only
//! written after a commit has landed, and a record's hash, counts, and
//! timestamp are always written together in one statement.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{IngestError, Result};
use crate::models::Project;

#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    async fn find(&self, name: &str) -> Result<Option<Project>>;

    /// Insert or fully overwrite a project record.
    async fn upsert(&self, project: &Project) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<bool>;

    /// All projects, sorted by name.
    async fn list(&self) -> Result<Vec<Project>>;
}

/// SQLite implementation over the `projects` table.
pub struct SqliteProjectRegistry {
    pool: SqlitePool,
}

impl SqliteProjectRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> Project {
    Project {
        name: row.get("name"),
        content_hash: row.get("content_hash"),
        file_count: row.get::<i64, _>("file_count") as u64,
        total_bytes: row.get::<i64, _>("total_bytes") as u64,
        updated_at: ts_to_datetime(row.get("updated_at")),
    }
}

#[async_trait]
impl ProjectRegistry for SqliteProjectRegistry {
    async fn find(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT name, content_hash, file_count, total_bytes, updated_at FROM projects WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_project))
    }

    async fn upsert(&self, project: &Project) -> Result<()> {
        let file_count = i64::try_from(project.file_count).map_err(IngestError::registry)?;
        let total_bytes = i64::try_from(project.total_bytes).map_err(IngestError::registry)?;

        sqlx::query(
            r#"
            INSERT INTO projects (name, content_hash, file_count, total_bytes, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                content_hash = excluded.content_hash,
                file_count = excluded.file_count,
                total_bytes = excluded.total_bytes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&project.name)
        .bind(&project.content_hash)
        .bind(file_count)
        .bind(total_bytes)
        .bind(project.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT name, content_hash, file_count, total_bytes, updated_at FROM projects ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_project).collect())
    }
}

/// In-memory registry for tests.
#[derive(Default)]
pub struct InMemoryProjectRegistry {
    projects: RwLock<HashMap<String, Project>>,
}

impl InMemoryProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRegistry for InMemoryProjectRegistry {
    async fn find(&self, name: &str) -> Result<Option<Project>> {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(projects.get(name).cloned())
    }

    async fn upsert(&self, project: &Project) -> Result<()> {
        self.projects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project.name.clone(), project.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        Ok(projects.remove(name).is_some())
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let mut all: Vec<Project> = self
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

//! Per-file annotation storage.
//!
//! The ingestion pipeline only needs a key-value view of annotations:
//! `(project, relative path) → text`, where the empty path is the
//! project-level description. [`AnnotationStore`] captures that interface;
//! [`SqliteAnnotationStore`] persists it and [`InMemoryAnnotationStore`]
//! backs tests.
//!
//! Saving empty (or whitespace-only) text deletes the entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{IngestError, Result};

#[async_trait]
pub trait AnnotationStore: Send + Sync {
    async fn get(&self, project: &str, path: &str) -> Result<Option<String>>;

    /// Store `text` (trimmed) for `path`; empty text deletes the entry.
    async fn save(&self, project: &str, path: &str, text: &str) -> Result<()>;

    /// All annotations for a project, keyed by relative path.
    async fn list_all(&self, project: &str) -> Result<BTreeMap<String, String>>;

    /// Drop every annotation belonging to `project`.
    async fn delete_project(&self, project: &str) -> Result<()>;
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "(project)"
    } else {
        path
    }
}

fn unavailable(e: sqlx::Error) -> IngestError {
    IngestError::AnnotationStoreUnavailable(e.to_string())
}

/// SQLite implementation over the `file_descriptions` table.
pub struct SqliteAnnotationStore {
    pool: SqlitePool,
}

impl SqliteAnnotationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnnotationStore for SqliteAnnotationStore {
    async fn get(&self, project: &str, path: &str) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT description FROM file_descriptions WHERE project_name = ? AND file_path = ?",
        )
        .bind(project)
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)
    }

    async fn save(&self, project: &str, path: &str, text: &str) -> Result<()> {
        let trimmed = text.trim();

        if trimmed.is_empty() {
            let result = sqlx::query(
                "DELETE FROM file_descriptions WHERE project_name = ? AND file_path = ?",
            )
            .bind(project)
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
            if result.rows_affected() > 0 {
                info!(project, file = display_path(path), "deleted description");
            }
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO file_descriptions (project_name, file_path, description, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(project_name, file_path) DO UPDATE SET
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(project)
        .bind(path)
        .bind(trimmed)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        info!(project, file = display_path(path), "saved description");
        Ok(())
    }

    async fn list_all(&self, project: &str) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            "SELECT file_path, description FROM file_descriptions WHERE project_name = ?",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows
            .iter()
            .map(|row| (row.get("file_path"), row.get("description")))
            .collect())
    }

    async fn delete_project(&self, project: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_descriptions WHERE project_name = ?")
            .bind(project)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryAnnotationStore {
    projects: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl InMemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnnotationStore for InMemoryAnnotationStore {
    async fn get(&self, project: &str, path: &str) -> Result<Option<String>> {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(projects.get(project).and_then(|m| m.get(path)).cloned())
    }

    async fn save(&self, project: &str, path: &str, text: &str) -> Result<()> {
        let trimmed = text.trim();
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        if trimmed.is_empty() {
            if let Some(entries) = projects.get_mut(project) {
                entries.remove(path);
            }
        } else {
            projects
                .entry(project.to_string())
                .or_default()
                .insert(path.to_string(), trimmed.to_string());
        }
        Ok(())
    }

    async fn list_all(&self, project: &str) -> Result<BTreeMap<String, String>> {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(projects.get(project).cloned().unwrap_or_default())
    }

    async fn delete_project(&self, project: &str) -> Result<()> {
        self.projects.write().unwrap_or_else(PoisonError::into_inner).remove(project);
        Ok(())
    }
}

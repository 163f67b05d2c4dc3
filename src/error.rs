//! Error type for the ingestion pipeline.
//!
//! Library operations return [`IngestError`]; the CLI wraps these in
//! `anyhow` for reporting. Security and corruption failures
//! ([`IngestError::PathEscape`], [`IngestError::CorruptArchive`]) are
//! never retried.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("archive entry '{entry}' resolves outside the extraction directory")]
    PathEscape { entry: String },

    #[error("archive is corrupt or unreadable: {reason}")]
    CorruptArchive { reason: String },

    #[error("invalid project name '{name}': {reason}")]
    InvalidProjectName { name: String, reason: &'static str },

    #[error("I/O failure at '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("commit of project '{project}' left storage partially written: {reason}")]
    PartialCommit { project: String, reason: String },

    #[error("annotation store unavailable: {0}")]
    AnnotationStoreUnavailable(String),

    #[error("storage backend error: {0}")]
    Storage(String),

    #[error("project registry error: {0}")]
    Registry(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt<E: std::fmt::Display>(e: E) -> Self {
        Self::CorruptArchive {
            reason: e.to_string(),
        }
    }

    pub fn storage<E: std::fmt::Display>(e: E) -> Self {
        Self::Storage(e.to_string())
    }

    pub fn registry<E: std::fmt::Display>(e: E) -> Self {
        Self::Registry(e.to_string())
    }

    /// True for failures caused by the archive itself rather than the
    /// environment. Retrying these gains nothing.
    pub fn is_archive_fault(&self) -> bool {
        matches!(
            self,
            IngestError::PathEscape { .. } | IngestError::CorruptArchive { .. }
        )
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        Self::Registry(e.to_string())
    }
}

//! Storage backends for staged archives and committed project trees.
//!
//! A backend owns two namespaces:
//!
//! - **staged archives**: the raw uploaded ZIP, kept under its sanitized
//!   file name so it can be re-read later.
//! - **projects**: one committed tree per project name.
//!
//! Two implementations exist: [`local::LocalStorageBackend`] (a directory
//! on disk) and [`s3::ObjectStorageBackend`] (an S3-compatible bucket).
//! The backend is chosen once at startup by [`build_backend`] and shared as
//! `Arc<dyn StorageBackend>`.
//!
//! Callers never see backend-specific paths except through
//! [`StorageBackend::project_location`]. Anything that needs to read a
//! whole tree (hashing, merging) asks for a local view via
//! [`StorageBackend::materialize_project`].

pub mod local;
pub mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::{NamedTempFile, TempDir};

use crate::config::{BackendKind, Config};
use crate::error::{IngestError, Result};
use crate::models::StorageLocation;

/// Longest accepted project name, in bytes.
pub const MAX_PROJECT_NAME_LEN: usize = 255;

/// How a commit treats an existing tree under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// No project was registered under this name.
    Create,
    /// A registered project is being replaced wholesale.
    Replace,
}

/// Handle to an uploaded archive held by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArchive {
    /// Sanitized file name, e.g. `demo.zip`.
    pub file_name: String,
    pub size: u64,
}

/// A staged archive available as a local file.
///
/// For remote backends the file is a temporary download, deleted when the
/// handle drops.
#[derive(Debug)]
pub struct LocalArchive {
    path: PathBuf,
    _guard: Option<NamedTempFile>,
}

impl LocalArchive {
    pub(crate) fn borrowed(path: PathBuf) -> Self {
        Self { path, _guard: None }
    }

    pub(crate) fn temporary(file: NamedTempFile) -> Self {
        Self {
            path: file.path().to_path_buf(),
            _guard: Some(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A committed project tree available on the local filesystem.
#[derive(Debug)]
pub struct LocalTree {
    root: PathBuf,
    _guard: Option<TempDir>,
}

impl LocalTree {
    pub(crate) fn borrowed(root: PathBuf) -> Self {
        Self { root, _guard: None }
    }

    pub(crate) fn temporary(dir: TempDir) -> Self {
        Self {
            root: dir.path().to_path_buf(),
            _guard: Some(dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short identifier for logs (`"local"`, `"s3"`).
    fn kind(&self) -> &'static str;

    /// Persist the raw upload. Overwrites an earlier archive of the same name.
    async fn stage_archive(&self, file_name: &str, bytes: Vec<u8>) -> Result<StagedArchive>;

    /// Make a staged archive readable as a local file.
    async fn materialize_archive(&self, staged: &StagedArchive) -> Result<LocalArchive>;

    fn project_location(&self, name: &str) -> StorageLocation;

    /// Names of all committed projects, sorted.
    async fn list_projects(&self) -> Result<Vec<String>>;

    /// Publish every regular file under `content_root` as project `name`,
    /// replacing whatever was committed under that name before.
    async fn commit_project(&self, name: &str, content_root: &Path, mode: CommitMode)
        -> Result<()>;

    /// Remove a committed project. Returns `false` if nothing was stored.
    async fn delete_project(&self, name: &str) -> Result<bool>;

    /// `/`-joined relative paths of every file in a committed project, sorted.
    ///
    /// Object stores have no directories, so a project committed with no
    /// files lists as empty there rather than not found.
    async fn list_project_files(&self, name: &str) -> Result<Vec<String>>;

    async fn read_project_file(&self, name: &str, relative_path: &str) -> Result<Vec<u8>>;

    /// A local view of a committed project, or `None` if nothing is stored.
    async fn materialize_project(&self, name: &str) -> Result<Option<LocalTree>>;
}

/// Construct the configured backend.
///
/// For S3 this reads credentials from the environment and, when
/// `create_bucket` is set, creates the bucket if it is missing.
pub async fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.storage.kind()? {
        BackendKind::Local => {
            let local = config
                .storage
                .local
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[storage.local] is not configured"))?;
            Ok(Arc::new(local::LocalStorageBackend::new(&local.base_dir)))
        }
        BackendKind::S3 => {
            let s3_config = config
                .storage
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[storage.s3] is not configured"))?;
            let creds = s3::AwsCredentials::from_env()?;
            let backend = s3::ObjectStorageBackend::new(s3_config, creds)?;
            if s3_config.create_bucket {
                backend.ensure_bucket().await?;
            }
            Ok(Arc::new(backend))
        }
    }
}

/// Check that `name` is safe to use as a directory name and key prefix.
pub fn validate_project_name(name: &str) -> Result<()> {
    let invalid = |reason: &'static str| IngestError::InvalidProjectName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_PROJECT_NAME_LEN {
        return Err(invalid("name is longer than 255 bytes"));
    }
    if name.contains('\0') {
        return Err(invalid("name contains a NUL byte"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("name contains a path separator"));
    }
    if name.contains("..") {
        return Err(invalid("name contains '..'"));
    }
    if name.starts_with('.') {
        return Err(invalid("name starts with '.'"));
    }
    Ok(())
}

/// Sanitize an uploaded file name: every character outside
/// `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive `(sanitized file name, project name)` from an uploaded file name.
///
/// The file must end in `.zip` (any case); the project name is the stem.
pub fn project_name_from_archive(file_name: &str) -> Result<(String, String)> {
    let sanitized = sanitize_file_name(file_name);
    let stem_len = sanitized.len().saturating_sub(".zip".len());
    if sanitized.len() <= ".zip".len() || !sanitized[stem_len..].eq_ignore_ascii_case(".zip") {
        return Err(IngestError::InvalidProjectName {
            name: file_name.to_string(),
            reason: "upload must be a non-empty .zip file name",
        });
    }

    let project = sanitized[..stem_len].to_string();
    validate_project_name(&project)?;
    Ok((sanitized, project))
}

/// Reject relative paths that could leave a project tree.
pub(crate) fn validate_relative_path(relative_path: &str) -> Result<()> {
    let escape = || IngestError::PathEscape {
        entry: relative_path.to_string(),
    };
    if relative_path.is_empty() || relative_path.starts_with('/') || relative_path.contains('\0') {
        return Err(escape());
    }
    if relative_path
        .split(['/', '\\'])
        .any(|segment| segment == ".." || segment.ends_with(':'))
    {
        return Err(escape());
    }
    Ok(())
}

//! Filesystem storage backend.
//!
//! Layout under the configured base directory:
//!
//! ```text
//! <base>/staged-archives/<file>.zip
//! <base>/projects/<name>/...
//! <base>/projects/.incoming-<uuid>/   (commit in progress)
//! <base>/projects/.retired-<uuid>/    (previous tree being removed)
//! ```
//!
//! A commit copies the content root into a hidden `.incoming-*` sibling,
//! moves any existing tree aside, and renames the new tree into place. The
//! swap is two renames on the same filesystem, so readers see either the
//! old tree or the new one. All file work runs on the blocking pool.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{
    validate_project_name, validate_relative_path, CommitMode, LocalArchive, LocalTree,
    StagedArchive, StorageBackend,
};
use crate::error::{IngestError, Result};
use crate::hasher::relative_slash_path;
use crate::models::StorageLocation;

const STAGED_DIR: &str = "staged-archives";
const PROJECTS_DIR: &str = "projects";

#[derive(Debug, Clone)]
pub struct LocalStorageBackend {
    base_dir: PathBuf,
}

impl LocalStorageBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn staged_dir(&self) -> PathBuf {
        self.base_dir.join(STAGED_DIR)
    }

    fn projects_dir(&self) -> PathBuf {
        self.base_dir.join(PROJECTS_DIR)
    }

    fn project_dir(&self, name: &str) -> PathBuf {
        self.projects_dir().join(name)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IngestError::storage(format!("blocking task failed: {}", e)))?
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn stage_archive(&self, file_name: &str, bytes: Vec<u8>) -> Result<StagedArchive> {
        validate_project_name(file_name)?;
        let dir = self.staged_dir();
        let file_name = file_name.to_string();

        blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| IngestError::io(&dir, e))?;
            // Write beside the target and rename so a crash never leaves a
            // truncated archive under the real name.
            let partial = dir.join(format!(".{}.part", uuid::Uuid::new_v4()));
            let dest = dir.join(&file_name);
            fs::write(&partial, &bytes).map_err(|e| IngestError::io(&partial, e))?;
            if let Err(e) = fs::rename(&partial, &dest) {
                let _ = fs::remove_file(&partial);
                return Err(IngestError::io(&dest, e));
            }
            debug!(archive = %dest.display(), bytes = bytes.len(), "archive staged");
            Ok(StagedArchive {
                file_name,
                size: bytes.len() as u64,
            })
        })
        .await
    }

    async fn materialize_archive(&self, staged: &StagedArchive) -> Result<LocalArchive> {
        let path = self.staged_dir().join(&staged.file_name);
        if !path.is_file() {
            return Err(IngestError::NotFound(format!(
                "staged archive '{}'",
                staged.file_name
            )));
        }
        Ok(LocalArchive::borrowed(path))
    }

    fn project_location(&self, name: &str) -> StorageLocation {
        StorageLocation::Local(self.project_dir(name))
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        let dir = self.projects_dir();
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            for entry in fs::read_dir(&dir).map_err(|e| IngestError::io(&dir, e))? {
                let entry = entry.map_err(|e| IngestError::io(&dir, e))?;
                let is_dir = entry
                    .file_type()
                    .map_err(|e| IngestError::io(entry.path(), e))?
                    .is_dir();
                let name = entry.file_name().to_string_lossy().to_string();
                if is_dir && !name.starts_with('.') {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn commit_project(
        &self,
        name: &str,
        content_root: &Path,
        mode: CommitMode,
    ) -> Result<()> {
        validate_project_name(name)?;
        let projects = self.projects_dir();
        let dest = self.project_dir(name);
        let source = content_root.to_path_buf();
        let project = name.to_string();

        blocking(move || {
            fs::create_dir_all(&projects).map_err(|e| IngestError::io(&projects, e))?;

            let incoming = projects.join(format!(".incoming-{}", uuid::Uuid::new_v4()));
            if let Err(e) = copy_tree(&source, &incoming) {
                let _ = fs::remove_dir_all(&incoming);
                return Err(e);
            }

            let retired = if dest.exists() {
                if mode == CommitMode::Create {
                    warn!(project = %project, "unregistered tree found at destination; replacing it");
                }
                let retired = projects.join(format!(".retired-{}", uuid::Uuid::new_v4()));
                if let Err(e) = fs::rename(&dest, &retired) {
                    let _ = fs::remove_dir_all(&incoming);
                    return Err(IngestError::io(&dest, e));
                }
                Some(retired)
            } else {
                None
            };

            if let Err(e) = fs::rename(&incoming, &dest) {
                // Put the previous tree back; if that fails too the
                // project is gone from its location.
                let restored = match &retired {
                    Some(old) => fs::rename(old, &dest).is_ok(),
                    None => true,
                };
                let _ = fs::remove_dir_all(&incoming);
                if restored {
                    return Err(IngestError::io(&dest, e));
                }
                return Err(IngestError::PartialCommit {
                    project,
                    reason: format!("rename into place failed: {}", e),
                });
            }

            if let Some(old) = retired {
                if let Err(e) = fs::remove_dir_all(&old) {
                    warn!(path = %old.display(), error = %e, "failed to remove retired tree");
                }
            }

            info!(project = %project, location = %dest.display(), ?mode, "project committed");
            Ok(())
        })
        .await
    }

    async fn delete_project(&self, name: &str) -> Result<bool> {
        validate_project_name(name)?;
        let dest = self.project_dir(name);
        blocking(move || {
            if !dest.exists() {
                return Ok(false);
            }
            fs::remove_dir_all(&dest).map_err(|e| IngestError::io(&dest, e))?;
            Ok(true)
        })
        .await
    }

    async fn list_project_files(&self, name: &str) -> Result<Vec<String>> {
        validate_project_name(name)?;
        let root = self.project_dir(name);
        let project = name.to_string();
        blocking(move || {
            if !root.is_dir() {
                return Err(IngestError::NotFound(format!("project '{}'", project)));
            }
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| {
                    let path = e.path().unwrap_or(&root).to_path_buf();
                    IngestError::io(path, e.into())
                })?;
                if entry.file_type().is_file() {
                    files.push(relative_slash_path(&root, entry.path()));
                }
            }
            files.sort();
            Ok(files)
        })
        .await
    }

    async fn read_project_file(&self, name: &str, relative_path: &str) -> Result<Vec<u8>> {
        validate_project_name(name)?;
        validate_relative_path(relative_path)?;
        let path = relative_path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .fold(self.project_dir(name), |acc, part| acc.join(part));
        let display = format!("{}/{}", name, relative_path);

        blocking(move || {
            if !path.is_file() {
                return Err(IngestError::NotFound(display));
            }
            fs::read(&path).map_err(|e| IngestError::io(&path, e))
        })
        .await
    }

    async fn materialize_project(&self, name: &str) -> Result<Option<LocalTree>> {
        validate_project_name(name)?;
        let root = self.project_dir(name);
        Ok(root.is_dir().then(|| LocalTree::borrowed(root)))
    }
}

/// Recursively copy regular files and directories. Symlinks are skipped.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| IngestError::io(dest, e))?;

    for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            IngestError::io(path, e.into())
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| IngestError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(|e| IngestError::io(&target, e))?;
        }
    }
    Ok(())
}

//! Upload pipeline orchestration.
//!
//! One upload moves through:
//!
//! ```text
//! Received → Staged → Extracted → Hashed → Unchanged
//!                                        → Creating  → Committed
//!                                        → Replacing → Committed
//! ```
//!
//! Any failure before `Committed` leaves the committed tree and the
//! registry as they were; the per-upload staging directory is removed when
//! the upload returns, whatever the outcome. `Unchanged` touches no
//! storage at all.
//!
//! Uploads for the same project name are serialized by an in-process lock
//! taken before the archive is staged and held until the registry has been
//! updated. Staging writes to a per-name location, so two uploads of one
//! project must not interleave there either. Uploads of different projects
//! proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::annotations::AnnotationStore;
use crate::archive::{self, ExtractOptions};
use crate::error::{IngestError, Result};
use crate::hasher;
use crate::merge::{self, MergeOutcome};
use crate::models::{ExtractionStats, IntegrityReport, Project, TreeSummary, UploadOutcome};
use crate::registry::ProjectRegistry;
use crate::storage::{self, CommitMode, StorageBackend};
use crate::tree::FileTree;

pub struct Ingestor {
    backend: Arc<dyn StorageBackend>,
    registry: Arc<dyn ProjectRegistry>,
    annotations: Arc<dyn AnnotationStore>,
    options: ExtractOptions,
    locks: LockMap,
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds one project's lock. On drop, the map entry is removed once no
/// other upload holds or waits on it.
struct ProjectGuard<'a> {
    locks: &'a LockMap,
    name: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ProjectGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

/// What extraction and hashing produced for one upload.
struct Prepared {
    stats: ExtractionStats,
    content_root: PathBuf,
    hash: String,
    summary: TreeSummary,
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

impl Ingestor {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        registry: Arc<dyn ProjectRegistry>,
        annotations: Arc<dyn AnnotationStore>,
        options: ExtractOptions,
    ) -> Self {
        Self {
            backend,
            registry,
            annotations,
            options,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    async fn lock_project(&self, name: &str) -> ProjectGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(name.to_string()).or_default().clone()
        };
        ProjectGuard {
            locks: &self.locks,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Ingest one uploaded archive.
    ///
    /// The project name is the sanitized stem of `file_name`, which must end
    /// in `.zip`.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidProjectName`] before any I/O if the name is
    ///   unusable.
    /// - [`IngestError::PathEscape`] / [`IngestError::CorruptArchive`] for
    ///   hostile or broken archives; nothing is committed.
    /// - [`IngestError::PartialCommit`] if the backend failed half-way
    ///   through replacing the stored tree. The registry keeps the previous
    ///   hash, so the same upload can be retried.
    pub async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<UploadOutcome> {
        let (archive_name, project) = storage::project_name_from_archive(file_name)?;
        info!(project = %project, bytes = bytes.len(), "upload received");

        let _guard = self.lock_project(&project).await;

        let staged = self.backend.stage_archive(&archive_name, bytes).await?;
        info!(
            project = %project,
            backend = self.backend.kind(),
            bytes = staged.size,
            "archive staged"
        );

        let local_archive = self.backend.materialize_archive(&staged).await?;
        let staging = TempDir::new().map_err(|e| IngestError::io(std::env::temp_dir(), e))?;

        let archive_path = local_archive.path().to_path_buf();
        let staging_path = staging.path().to_path_buf();
        let options = self.options;
        let prepared = blocking(move || {
            let stats = archive::extract_archive(&archive_path, &staging_path, &options)?;
            let content_root = archive::flatten(&staging_path)?;
            let hash = hasher::hash_tree(&content_root)?;
            let summary = hasher::summarize(&content_root)?;
            Ok(Prepared {
                stats,
                content_root,
                hash,
                summary,
            })
        })
        .await;
        drop(local_archive);

        let prepared = match prepared {
            Ok(p) => p,
            Err(e) => {
                warn!(project = %project, error = %e, "extraction failed; nothing committed");
                return Err(e);
            }
        };
        info!(
            project = %project,
            extracted = prepared.stats.extracted,
            skipped = prepared.stats.skipped,
            hash = %prepared.hash,
            "archive extracted and hashed"
        );

        let existing = self.registry.find(&project).await?;
        if let Some(ref current) = existing {
            if current.content_hash == prepared.hash {
                info!(project = %project, "content unchanged; skipping commit");
                return Ok(UploadOutcome::AlreadyUploaded {
                    project_name: project,
                });
            }
        }

        let mode = if existing.is_some() {
            CommitMode::Replace
        } else {
            CommitMode::Create
        };
        info!(project = %project, ?mode, "committing project");

        let (old_annotations, merged) = match mode {
            CommitMode::Create => (None, MergeOutcome::default()),
            CommitMode::Replace => self.merge_annotations(&project, &prepared).await,
        };

        self.backend
            .commit_project(&project, &prepared.content_root, mode)
            .await?;

        self.registry
            .upsert(&Project {
                name: project.clone(),
                content_hash: prepared.hash.clone(),
                file_count: prepared.summary.file_count,
                total_bytes: prepared.summary.total_bytes,
                updated_at: Utc::now(),
            })
            .await?;

        if let Some(old) = old_annotations {
            self.prune_annotations(&project, &old, &merged.preserved).await;
        }

        info!(
            project = %project,
            location = %self.backend.project_location(&project),
            preserved = merged.preserved_count,
            "project committed"
        );

        Ok(UploadOutcome::Ingested {
            project_name: project,
            extracted_count: prepared.stats.extracted,
            skipped_count: prepared.stats.skipped,
            skipped_by_reason: prepared.stats.skipped_by_reason,
            preserved_annotation_count: merged.preserved_count,
            replaced: mode == CommitMode::Replace,
        })
    }

    /// Read the project's annotations and intersect them with the new tree.
    ///
    /// Returns `None` for the old set when the store could not be read; the
    /// upload then proceeds with nothing preserved and nothing pruned.
    async fn merge_annotations(
        &self,
        project: &str,
        prepared: &Prepared,
    ) -> (Option<BTreeMap<String, String>>, MergeOutcome) {
        let old = match self.annotations.list_all(project).await {
            Ok(old) => old,
            Err(e) => {
                warn!(project, error = %e, "annotation store unavailable; preserving none");
                return (None, MergeOutcome::default());
            }
        };

        let root = prepared.content_root.clone();
        let lookup = old.clone();
        match blocking(move || merge::merge(&lookup, &root)).await {
            Ok(merged) => (Some(old), merged),
            Err(e) => {
                warn!(project, error = %e, "annotation merge failed; preserving none");
                (None, MergeOutcome::default())
            }
        }
    }

    /// Delete file annotations that did not survive the replace. The
    /// project-level annotation is kept.
    async fn prune_annotations(
        &self,
        project: &str,
        old: &BTreeMap<String, String>,
        preserved: &BTreeMap<String, String>,
    ) {
        let stale = old
            .keys()
            .filter(|path| !path.is_empty() && !preserved.contains_key(*path));
        for path in stale {
            if let Err(e) = self.annotations.save(project, path, "").await {
                warn!(project, file = %path, error = %e, "failed to prune stale annotation");
            }
        }
    }

    /// Re-hash the committed tree and compare it with the registry.
    pub async fn verify_project(&self, name: &str) -> Result<IntegrityReport> {
        storage::validate_project_name(name)?;
        let project = self
            .registry
            .find(name)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("project '{}'", name)))?;

        let Some(tree) = self.backend.materialize_project(name).await? else {
            // An object store keeps nothing for a project with no files.
            if project.content_hash == hasher::empty_tree_hash() {
                return Ok(IntegrityReport::Consistent {
                    hash: project.content_hash,
                });
            }
            warn!(project = name, "registered project has no stored tree");
            return Ok(IntegrityReport::Missing {
                expected: project.content_hash,
            });
        };

        let actual = blocking(move || hasher::hash_tree(tree.root())).await?;
        if actual == project.content_hash {
            Ok(IntegrityReport::Consistent { hash: actual })
        } else {
            warn!(project = name, expected = %project.content_hash, actual = %actual, "stored tree drifted");
            Ok(IntegrityReport::Drifted {
                expected: project.content_hash,
                actual,
            })
        }
    }

    /// Remove a project from storage, the registry, and the annotation store.
    /// Returns `false` if it existed in none of them.
    pub async fn delete_project(&self, name: &str) -> Result<bool> {
        storage::validate_project_name(name)?;
        let _guard = self.lock_project(name).await;

        let stored = self.backend.delete_project(name).await?;
        let registered = self.registry.remove(name).await?;
        self.annotations.delete_project(name).await?;

        if stored || registered {
            info!(project = name, "project deleted");
        }
        Ok(stored || registered)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.registry.list().await
    }

    pub async fn tree(&self, name: &str) -> Result<FileTree> {
        self.require_registered(name).await?;
        let files = self.backend.list_project_files(name).await?;
        Ok(FileTree::from_paths(name, files))
    }

    pub async fn read_file(&self, name: &str, relative_path: &str) -> Result<Vec<u8>> {
        self.backend.read_project_file(name, relative_path).await
    }

    /// Set (or, with empty text, clear) the annotation on a file of a
    /// registered project. An empty `relative_path` addresses the project
    /// itself.
    pub async fn annotate(&self, name: &str, relative_path: &str, text: &str) -> Result<()> {
        self.require_registered(name).await?;
        if !relative_path.is_empty() {
            storage::validate_relative_path(relative_path)?;
        }
        self.annotations.save(name, relative_path, text).await
    }

    pub async fn annotation(&self, name: &str, relative_path: &str) -> Result<Option<String>> {
        self.require_registered(name).await?;
        self.annotations.get(name, relative_path).await
    }

    pub async fn annotations(&self, name: &str) -> Result<BTreeMap<String, String>> {
        self.require_registered(name).await?;
        self.annotations.list_all(name).await
    }

    async fn require_registered(&self, name: &str) -> Result<()> {
        storage::validate_project_name(name)?;
        match self.registry.find(name).await? {
            Some(_) => Ok(()),
            None => Err(IngestError::NotFound(format!("project '{}'", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::InMemoryAnnotationStore;
    use crate::models::SkipReason;
    use crate::registry::InMemoryProjectRegistry;
    use crate::storage::local::LocalStorageBackend;
    use async_trait::async_trait;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    struct Harness {
        _base: TempDir,
        ingestor: Ingestor,
        annotations: Arc<dyn AnnotationStore>,
    }

    fn harness_with(annotations: Arc<dyn AnnotationStore>) -> Harness {
        let base = TempDir::new().unwrap();
        let ingestor = Ingestor::new(
            Arc::new(LocalStorageBackend::new(base.path())),
            Arc::new(InMemoryProjectRegistry::new()),
            annotations.clone(),
            ExtractOptions::default(),
        );
        Harness {
            _base: base,
            ingestor,
            annotations,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryAnnotationStore::new()))
    }

    #[tokio::test]
    async fn first_upload_creates_project() {
        let h = harness();
        let archive = zip_bytes(&[
            ("index.js", "main"),
            ("node_modules/dep/index.js", "dep"),
        ]);
        let outcome = h.ingestor.upload("a.zip", archive).await.unwrap();

        match outcome {
            UploadOutcome::Ingested {
                project_name,
                extracted_count,
                skipped_count,
                skipped_by_reason,
                replaced,
                ..
            } => {
                assert_eq!(project_name, "a");
                assert_eq!(extracted_count, 1);
                assert_eq!(skipped_count, 1);
                assert_eq!(skipped_by_reason.get(&SkipReason::DeniedFolder), Some(&1));
                assert!(!replaced);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.ingestor.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identical_reupload_is_unchanged() {
        let h = harness();
        let archive = zip_bytes(&[("src/Foo.java", "X")]);
        h.ingestor.upload("demo.zip", archive.clone()).await.unwrap();
        let before = h.ingestor.list_projects().await.unwrap();

        let outcome = h.ingestor.upload("demo.zip", archive).await.unwrap();
        assert!(outcome.is_already_uploaded());
        assert_eq!(h.ingestor.list_projects().await.unwrap(), before);
    }

    #[tokio::test]
    async fn replace_preserves_intersection_and_project_note() {
        let h = harness();
        h.ingestor
            .upload("b.zip", zip_bytes(&[("src/Foo.java", "X"), ("src/Old.java", "old")]))
            .await
            .unwrap();
        h.ingestor.annotate("b", "src/Foo.java", "entry point").await.unwrap();
        h.ingestor.annotate("b", "src/Old.java", "legacy").await.unwrap();
        h.ingestor.annotate("b", "", "demo project").await.unwrap();

        let outcome = h
            .ingestor
            .upload("b.zip", zip_bytes(&[("src/Foo.java", "Y"), ("src/New.java", "new")]))
            .await
            .unwrap();
        match outcome {
            UploadOutcome::Ingested {
                preserved_annotation_count,
                replaced,
                ..
            } => {
                assert_eq!(preserved_annotation_count, 1);
                assert!(replaced);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let all = h.annotations.list_all("b").await.unwrap();
        assert_eq!(all.get("src/Foo.java").map(String::as_str), Some("entry point"));
        assert_eq!(all.get("").map(String::as_str), Some("demo project"));
        assert!(!all.contains_key("src/Old.java"));
        assert_eq!(h.ingestor.read_file("b", "src/Foo.java").await.unwrap(), b"Y");
    }

    #[tokio::test]
    async fn traversal_leaves_existing_project_untouched() {
        let h = harness();
        h.ingestor
            .upload("p.zip", zip_bytes(&[("a.txt", "safe")]))
            .await
            .unwrap();
        let before = h.ingestor.list_projects().await.unwrap();

        let err = h
            .ingestor
            .upload("p.zip", zip_bytes(&[("ok.txt", "x"), ("../evil.txt", "x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::PathEscape { .. }));
        assert_eq!(h.ingestor.list_projects().await.unwrap(), before);
        assert_eq!(h.ingestor.read_file("p", "a.txt").await.unwrap(), b"safe");
    }

    #[tokio::test]
    async fn invalid_name_rejected_before_staging() {
        let h = harness();
        let err = h.ingestor.upload("notes.txt", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidProjectName { .. }));
    }

    struct UnavailableAnnotations;

    #[async_trait]
    impl AnnotationStore for UnavailableAnnotations {
        async fn get(&self, _: &str, _: &str) -> Result<Option<String>> {
            Err(IngestError::AnnotationStoreUnavailable("down".into()))
        }
        async fn save(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Err(IngestError::AnnotationStoreUnavailable("down".into()))
        }
        async fn list_all(&self, _: &str) -> Result<BTreeMap<String, String>> {
            Err(IngestError::AnnotationStoreUnavailable("down".into()))
        }
        async fn delete_project(&self, _: &str) -> Result<()> {
            Err(IngestError::AnnotationStoreUnavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn annotation_outage_degrades_to_zero_preserved() {
        let h = harness_with(Arc::new(UnavailableAnnotations));
        h.ingestor
            .upload("c.zip", zip_bytes(&[("a.txt", "1")]))
            .await
            .unwrap();
        let outcome = h
            .ingestor
            .upload("c.zip", zip_bytes(&[("a.txt", "2")]))
            .await
            .unwrap();
        match outcome {
            UploadOutcome::Ingested {
                preserved_annotation_count,
                replaced,
                ..
            } => {
                assert_eq!(preserved_annotation_count, 0);
                assert!(replaced);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_detects_drift_and_missing() {
        let h = harness();
        h.ingestor
            .upload("v.zip", zip_bytes(&[("a.txt", "1")]))
            .await
            .unwrap();
        assert!(matches!(
            h.ingestor.verify_project("v").await.unwrap(),
            IntegrityReport::Consistent { .. }
        ));

        let location = match h.ingestor.backend().project_location("v") {
            crate::models::StorageLocation::Local(path) => path,
            other => panic!("unexpected location {other}"),
        };
        std::fs::write(location.join("a.txt"), "tampered").unwrap();
        assert!(matches!(
            h.ingestor.verify_project("v").await.unwrap(),
            IntegrityReport::Drifted { .. }
        ));

        std::fs::remove_dir_all(&location).unwrap();
        assert!(matches!(
            h.ingestor.verify_project("v").await.unwrap(),
            IntegrityReport::Missing { .. }
        ));
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let h = harness();
        h.ingestor
            .upload("d.zip", zip_bytes(&[("a.txt", "1")]))
            .await
            .unwrap();
        h.ingestor.annotate("d", "a.txt", "note").await.unwrap();

        assert!(h.ingestor.delete_project("d").await.unwrap());
        assert!(h.ingestor.list_projects().await.unwrap().is_empty());
        assert!(h.annotations.list_all("d").await.unwrap().is_empty());
        assert!(!h.ingestor.delete_project("d").await.unwrap());
    }

    #[tokio::test]
    async fn project_locks_are_released() {
        let h = harness();
        h.ingestor
            .upload("l.zip", zip_bytes(&[("a.txt", "1")]))
            .await
            .unwrap();
        h.ingestor
            .upload("bad.zip", b"not a zip".to_vec())
            .await
            .unwrap_err();
        assert!(h.ingestor.delete_project("l").await.unwrap());
        assert!(h.ingestor.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn annotate_requires_registered_project() {
        let h = harness();
        let err = h.ingestor.annotate("ghost", "a.txt", "x").await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[tokio::test]
    async fn tree_lists_committed_files() {
        let h = harness();
        h.ingestor
            .upload("t.zip", zip_bytes(&[("wrapper/src/a.rs", "a"), ("wrapper/b.txt", "b")]))
            .await
            .unwrap();
        let tree = h.ingestor.tree("t").await.unwrap();
        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.render(), "t/\n  src/\n    a.rs\n  b.txt\n");
    }
}

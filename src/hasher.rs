//! Content fingerprinting for change detection.
//!
//! [`hash_tree`] feeds the raw bytes of every regular file under a root
//! into a single SHA-256, in lexicographic order of the `/`-joined relative
//! paths. Sorting is what makes the digest independent of archive entry
//! order and directory iteration order.
//!
//! Only file *contents* are hashed. Names and structure are not: moving or
//! renaming a file without changing any bytes produces the same digest, and
//! so does splitting one file's bytes across two files that sort adjacently.
//! Uploads that only rename files are therefore reported as unchanged.
//!
//! Files under denied folders (see [`crate::skip::DENIED_FOLDERS`]) are
//! excluded, matching what extraction would have dropped.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use crate::error::{IngestError, Result};
use crate::models::TreeSummary;
use crate::skip;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// A regular file found under a hash root.
#[derive(Debug, Clone)]
pub struct TreeFile {
    /// Path relative to the root, always `/`-separated.
    pub relative: String,
    pub path: PathBuf,
    pub len: u64,
}

/// List regular files under `root`, sorted by relative path.
///
/// Denied folders are pruned. Symlinks are not followed.
pub fn collect_files(root: &Path) -> Result<Vec<TreeFile>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_denied_dir(e, root));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            IngestError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = relative_slash_path(root, path);
        let len = entry
            .metadata()
            .map_err(|e| IngestError::io(path, e.into()))?
            .len();

        files.push(TreeFile {
            relative,
            path: path.to_path_buf(),
            len,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Compute the hex SHA-256 fingerprint of a tree.
pub fn hash_tree(root: &Path) -> Result<String> {
    let files = collect_files(root)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];

    for file in &files {
        let mut handle = File::open(&file.path).map_err(|e| IngestError::io(&file.path, e))?;
        loop {
            let n = handle
                .read(&mut buf)
                .map_err(|e| IngestError::io(&file.path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// The fingerprint of a tree with no files.
pub fn empty_tree_hash() -> String {
    hex::encode(Sha256::new().finalize())
}

/// Count files and bytes over the same file set [`hash_tree`] hashes.
pub fn summarize(root: &Path) -> Result<TreeSummary> {
    let files = collect_files(root)?;
    Ok(TreeSummary {
        file_count: files.len() as u64,
        total_bytes: files.iter().map(|f| f.len).sum(),
    })
}

/// `/`-joined path of `path` relative to `root`.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_denied_dir(entry: &DirEntry, root: &Path) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.path() != root
        && entry
            .file_name()
            .to_str()
            .map(skip::is_denied_folder)
            .unwrap_or(false)
}

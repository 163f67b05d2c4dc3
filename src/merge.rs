//! Carry annotations forward across a project replace.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::hasher;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub preserved: BTreeMap<String, String>,
    pub preserved_count: usize,
}

/// Keep the annotations in `old` whose relative path names a regular file
/// under `new_root`. Annotations for paths that no longer exist are dropped.
///
/// The project-level annotation (empty path) never matches a file and is
/// not part of the result; callers manage it separately.
pub fn merge(old: &BTreeMap<String, String>, new_root: &Path) -> Result<MergeOutcome> {
    if old.is_empty() {
        return Ok(MergeOutcome::default());
    }

    let mut preserved = BTreeMap::new();
    for file in walk_regular_files(new_root)? {
        if let Some(text) = old.get(&file) {
            preserved.insert(file, text.clone());
        }
    }

    let preserved_count = preserved.len();
    Ok(MergeOutcome {
        preserved,
        preserved_count,
    })
}

// Every regular file, denied folders included: an annotation on a file that
// is physically present is kept even if the hasher ignores that folder.
fn walk_regular_files(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            crate::error::IngestError::io(path, e.into())
        })?;
        if entry.file_type().is_file() {
            out.push(hasher::relative_slash_path(root, entry.path()));
        }
    }
    Ok(out)
}

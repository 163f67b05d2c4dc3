//! Archive entry exclusion rules.
//!
//! [`classify`] decides whether an entry is dropped during extraction.
//! Rules are evaluated in order and the first match wins:
//!
//! | Order | Rule | Reason |
//! |-------|------|--------|
//! | 1 | any path segment starts with `.` | [`SkipReason::HiddenPathSegment`] |
//! | 2 | path contains a denied folder | [`SkipReason::DeniedFolder`] |
//! | 3 | name ends with a denied extension | [`SkipReason::DeniedExtension`] |
//!
//! The same folder list is reused by the content hasher so that folders
//! surviving from nested archives never influence the fingerprint.

use crate::models::SkipReason;

/// Dependency caches, build output, and IDE state.
pub const DENIED_FOLDERS: &[&str] = &[
    "node_modules",
    "__pycache__",
    "venv",
    ".idea",
    ".vscode",
    "target",
    "build",
];

/// Executables, compiled bytecode, shared libraries, archives, media, logs.
pub const DENIED_EXTENSIONS: &[&str] = &[
    ".jar", ".class", ".exe", ".dll", ".so", ".bin", ".zip", ".tar", ".7z", ".rar", ".png", ".jpg",
    ".jpeg", ".gif", ".webp", ".ico", ".mp4", ".mp3", ".wav", ".mov", ".avi", ".log", ".pdf",
];

/// Classify an archive entry name. `None` means the entry is kept.
pub fn classify(entry_name: &str) -> Option<SkipReason> {
    let name = entry_name.replace('\\', "/").to_lowercase();

    if name.split('/').any(|segment| segment.starts_with('.')) {
        return Some(SkipReason::HiddenPathSegment);
    }

    // Substring match on "<folder>/" so "src/build/x" is denied but
    // "src/builder.rs" is not.
    if DENIED_FOLDERS
        .iter()
        .any(|folder| name.contains(&format!("{}/", folder)))
    {
        return Some(SkipReason::DeniedFolder);
    }

    if DENIED_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        return Some(SkipReason::DeniedExtension);
    }

    None
}

/// True if a single path component names a denied folder.
pub fn is_denied_folder(component: &str) -> bool {
    let lower = component.to_lowercase();
    DENIED_FOLDERS.iter().any(|folder| *folder == lower)
}

//! Secure archive extraction.
//!
//! Reads ZIP archives entry by entry and writes kept entries into a
//! staging directory. Every entry name is resolved against the target
//! directory before anything is written; a single escaping name aborts the
//! whole extraction with [`IngestError::PathEscape`] and leaves the target
//! untouched.
//!
//! Entries are never materialized in memory: each is copied to disk through
//! a fixed-size buffer and capped at `max_entry_bytes` of decompressed data
//! (zip-bomb protection). Symlink entries are written as regular files
//! containing their target text, so extraction never creates links.

use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::models::ExtractionStats;
use crate::skip;

/// Default cap on the decompressed size of a single entry (256 MiB).
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

const COPY_BUFFER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub max_entry_bytes: u64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }
}

/// Extract the archive at `archive_path` into `target_dir`.
pub fn extract_archive(
    archive_path: &Path,
    target_dir: &Path,
    options: &ExtractOptions,
) -> Result<ExtractionStats> {
    let file = File::open(archive_path).map_err(|e| IngestError::io(archive_path, e))?;
    extract_from_reader(file, target_dir, options)
}

/// Extract a ZIP stream into `target_dir`, returning per-reason counters.
///
/// # Errors
///
/// - [`IngestError::CorruptArchive`] if the stream is not a readable ZIP, an
///   entry fails to decompress, or an entry exceeds `max_entry_bytes`.
/// - [`IngestError::PathEscape`] if any entry resolves outside `target_dir`.
/// - [`IngestError::Io`] if writing into `target_dir` fails.
pub fn extract_from_reader<R: Read + Seek>(
    reader: R,
    target_dir: &Path,
    options: &ExtractOptions,
) -> Result<ExtractionStats> {
    let mut archive = zip::ZipArchive::new(reader).map_err(IngestError::corrupt)?;

    // Validate every name up front so a hostile archive writes zero bytes.
    for name in archive.file_names() {
        resolve_entry(target_dir, name)?;
    }

    let mut stats = ExtractionStats::default();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(IngestError::corrupt)?;
        let name = entry.name().to_string();

        if let Some(reason) = skip::classify(&name) {
            debug!(entry = %name, %reason, "skipped archive entry");
            stats.record_skip(reason);
            continue;
        }

        let out_path = resolve_entry(target_dir, &name)?;

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| IngestError::io(&out_path, e))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, e))?;
            }
            copy_bounded(&mut entry, &out_path, &name, options.max_entry_bytes)?;
        }

        stats.extracted += 1;
    }

    info!(
        extracted = stats.extracted,
        skipped = stats.skipped,
        target = %target_dir.display(),
        "archive extracted"
    );

    Ok(stats)
}

/// Resolve an entry name to a path strictly inside `target_dir`.
///
/// Names are treated as `/`-separated (backslashes included) regardless of
/// platform. `.` segments are dropped and `..` pops one level; popping past
/// the root, an absolute name, a drive prefix, or a NUL byte is an escape.
pub fn resolve_entry(target_dir: &Path, entry_name: &str) -> Result<PathBuf> {
    let escape = || IngestError::PathEscape {
        entry: entry_name.to_string(),
    };

    let normalized = entry_name.replace('\\', "/");
    if normalized.starts_with('/') || normalized.contains('\0') {
        return Err(escape());
    }

    let mut parts: Vec<&str> = Vec::new();
    for (i, segment) in normalized.split('/').enumerate() {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(escape());
                }
            }
            s if i == 0 && s.ends_with(':') => return Err(escape()),
            s => parts.push(s),
        }
    }

    let resolved = parts
        .iter()
        .fold(target_dir.to_path_buf(), |acc, part| acc.join(part));

    if !resolved.starts_with(target_dir) {
        return Err(escape());
    }
    Ok(resolved)
}

fn copy_bounded<R: Read>(
    entry: &mut R,
    out_path: &Path,
    name: &str,
    max_bytes: u64,
) -> Result<u64> {
    let mut out = File::create(out_path).map_err(|e| IngestError::io(out_path, e))?;
    let mut buf = [0u8; COPY_BUFFER_BYTES];
    let mut written: u64 = 0;

    loop {
        let n = entry.read(&mut buf).map_err(|e| IngestError::CorruptArchive {
            reason: format!("failed to decompress '{}': {}", name, e),
        })?;
        if n == 0 {
            break;
        }
        written += n as u64;
        if written > max_bytes {
            return Err(IngestError::CorruptArchive {
                reason: format!("entry '{}' exceeds size limit ({} bytes)", name, max_bytes),
            });
        }
        out.write_all(&buf[..n])
            .map_err(|e| IngestError::io(out_path, e))?;
    }

    out.flush().map_err(|e| IngestError::io(out_path, e))?;
    Ok(written)
}

/// Unwrap a single top-level folder.
///
/// Archive tools commonly wrap contents in one root directory. If `dir`
/// holds exactly one entry and it is a directory, that directory is the
/// content root; otherwise `dir` is. Only one level is unwrapped.
pub fn flatten(dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))?;

    let first = match entries.next() {
        Some(entry) => entry.map_err(|e| IngestError::io(dir, e))?,
        None => return Ok(dir.to_path_buf()),
    };
    if entries.next().is_some() {
        return Ok(dir.to_path_buf());
    }

    let file_type = first.file_type().map_err(|e| IngestError::io(first.path(), e))?;
    if file_type.is_dir() {
        Ok(first.path())
    } else {
        Ok(dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SkipReason;
    use std::io::Cursor;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        for (name, body) in entries {
            match body {
                Some(bytes) => {
                    writer.start_file(*name, opts).unwrap();
                    writer.write_all(bytes).unwrap();
                }
                None => {
                    writer.add_directory(*name, opts).unwrap();
                }
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn count_files(dir: &Path) -> usize {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn node_modules_entry_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let bytes = build_zip(&[
            ("src/Foo.java", Some(b"X")),
            ("node_modules/lib.js", Some(b"module.exports = 1")),
        ]);
        let stats =
            extract_from_reader(Cursor::new(bytes), tmp.path(), &ExtractOptions::default())
                .unwrap();

        assert_eq!(stats.extracted, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.skipped_by_reason.get(&SkipReason::DeniedFolder), Some(&1));
        assert_eq!(fs::read(tmp.path().join("src/Foo.java")).unwrap(), b"X");
        assert!(!tmp.path().join("node_modules").exists());
    }

    #[test]
    fn counts_sum_to_entry_total() {
        let tmp = TempDir::new().unwrap();
        let bytes = build_zip(&[
            ("app/", None),
            ("app/main.py", Some(b"print(1)")),
            ("app/.env", Some(b"SECRET=1")),
            ("app/logo.png", Some(b"\x89PNG")),
            ("app/__pycache__/main.pyc", Some(b"\0\0")),
            ("app/util.py", Some(b"")),
        ]);
        let stats =
            extract_from_reader(Cursor::new(bytes), tmp.path(), &ExtractOptions::default())
                .unwrap();

        assert_eq!(stats.total(), 6);
        assert_eq!(stats.extracted, 3);
        assert_eq!(stats.skipped_by_reason.values().sum::<usize>(), stats.skipped);
        assert_eq!(
            stats.skipped_by_reason.get(&SkipReason::HiddenPathSegment),
            Some(&1)
        );
        assert_eq!(
            stats.skipped_by_reason.get(&SkipReason::DeniedExtension),
            Some(&1)
        );
    }

    #[test]
    fn parent_traversal_rejected_before_any_write() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("stage");
        fs::create_dir_all(&target).unwrap();
        let bytes = build_zip(&[
            ("ok.txt", Some(b"fine")),
            ("../../evil.txt", Some(b"pwned")),
        ]);

        let err = extract_from_reader(Cursor::new(bytes), &target, &ExtractOptions::default())
            .unwrap_err();
        assert!(matches!(err, IngestError::PathEscape { .. }));
        assert_eq!(count_files(tmp.path()), 0);
    }

    #[test]
    fn traversal_rejected_even_when_entry_would_be_skipped() {
        let tmp = TempDir::new().unwrap();
        let bytes = build_zip(&[("../.ssh/authorized_keys", Some(b"key"))]);
        let err = extract_from_reader(Cursor::new(bytes), tmp.path(), &ExtractOptions::default())
            .unwrap_err();
        assert!(matches!(err, IngestError::PathEscape { .. }));
    }

    #[test]
    fn garbage_is_corrupt_archive() {
        let tmp = TempDir::new().unwrap();
        let err = extract_from_reader(
            Cursor::new(b"definitely not a zip".to_vec()),
            tmp.path(),
            &ExtractOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::CorruptArchive { .. }));
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let big = vec![b'a'; 4096];
        let bytes = build_zip(&[("big.txt", Some(&big))]);
        let err = extract_from_reader(
            Cursor::new(bytes),
            tmp.path(),
            &ExtractOptions {
                max_entry_bytes: 1024,
            },
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::CorruptArchive { .. }));
    }

    #[test]
    fn resolve_entry_cases() {
        let base = Path::new("/srv/stage");
        assert_eq!(
            resolve_entry(base, "a/./b/../c.txt").unwrap(),
            Path::new("/srv/stage/a/c.txt")
        );
        assert_eq!(
            resolve_entry(base, "a\\b.txt").unwrap(),
            Path::new("/srv/stage/a/b.txt")
        );
        assert!(resolve_entry(base, "../x").is_err());
        assert!(resolve_entry(base, "a/../../x").is_err());
        assert!(resolve_entry(base, "/etc/passwd").is_err());
        assert!(resolve_entry(base, "\\windows\\system32").is_err());
        assert!(resolve_entry(base, "C:/boot.ini").is_err());
        assert!(resolve_entry(base, "a\0b").is_err());
    }

    #[test]
    fn flatten_unwraps_single_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("project-main/src")).unwrap();
        fs::write(tmp.path().join("project-main/src/a.rs"), "fn a() {}").unwrap();
        assert_eq!(flatten(tmp.path()).unwrap(), tmp.path().join("project-main"));
    }

    #[test]
    fn flatten_unwraps_only_one_level() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("outer/inner")).unwrap();
        fs::write(tmp.path().join("outer/inner/a.txt"), "a").unwrap();
        assert_eq!(flatten(tmp.path()).unwrap(), tmp.path().join("outer"));
    }

    #[test]
    fn flatten_keeps_multi_entry_or_single_file_roots() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("only.txt"), "x").unwrap();
        assert_eq!(flatten(tmp.path()).unwrap(), tmp.path());

        fs::create_dir_all(tmp.path().join("src")).unwrap();
        assert_eq!(flatten(tmp.path()).unwrap(), tmp.path());

        let empty = TempDir::new().unwrap();
        assert_eq!(flatten(empty.path()).unwrap(), empty.path());
    }
}

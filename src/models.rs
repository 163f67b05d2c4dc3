//! Core data models used throughout the ingestion pipeline.
//!
//! These types describe projects, extraction statistics, and the upload
//! outcome returned to the (external) request layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Why an archive entry was excluded from extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    HiddenPathSegment,
    DeniedFolder,
    DeniedExtension,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::HiddenPathSegment => "hidden-path-segment",
            SkipReason::DeniedFolder => "denied-folder",
            SkipReason::DeniedExtension => "denied-extension",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters produced by one extraction call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStats {
    pub extracted: usize,
    pub skipped: usize,
    pub skipped_by_reason: BTreeMap<SkipReason, usize>,
}

impl ExtractionStats {
    pub fn record_skip(&mut self, reason: SkipReason) {
        self.skipped += 1;
        *self.skipped_by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn total(&self) -> usize {
        self.extracted + self.skipped
    }
}

/// A project as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub content_hash: String,
    pub file_count: u64,
    pub total_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

/// File count and byte total of a materialized tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeSummary {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Where a committed project tree lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
    /// A key prefix inside an object-store bucket.
    Object { bucket: String, prefix: String },
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocation::Local(path) => write!(f, "{}", path.display()),
            StorageLocation::Object { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
        }
    }
}

/// Result of an upload, as handed back to the request layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UploadOutcome {
    /// Content hash matched the registry; nothing was touched.
    AlreadyUploaded { project_name: String },
    /// A new project was created or an existing one replaced.
    Ingested {
        project_name: String,
        extracted_count: usize,
        skipped_count: usize,
        skipped_by_reason: BTreeMap<SkipReason, usize>,
        preserved_annotation_count: usize,
        replaced: bool,
    },
}

impl UploadOutcome {
    pub fn project_name(&self) -> &str {
        match self {
            UploadOutcome::AlreadyUploaded { project_name }
            | UploadOutcome::Ingested { project_name, .. } => project_name,
        }
    }

    pub fn is_already_uploaded(&self) -> bool {
        matches!(self, UploadOutcome::AlreadyUploaded { .. })
    }
}

/// Result of re-hashing a committed project against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum IntegrityReport {
    Consistent { hash: String },
    Drifted { expected: String, actual: String },
    /// Registered but nothing is committed in storage.
    Missing { expected: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_reason_serializes_kebab_case() {
        let json = serde_json::to_string(&SkipReason::DeniedFolder).unwrap();
        assert_eq!(json, "\"denied-folder\"");
    }

    #[test]
    fn outcome_uses_camel_case_fields() {
        let mut by_reason = BTreeMap::new();
        by_reason.insert(SkipReason::DeniedFolder, 1);
        let outcome = UploadOutcome::Ingested {
            project_name: "a".into(),
            extracted_count: 1,
            skipped_count: 1,
            skipped_by_reason: by_reason,
            preserved_annotation_count: 0,
            replaced: false,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "ingested");
        assert_eq!(json["projectName"], "a");
        assert_eq!(json["skippedByReason"]["denied-folder"], 1);
        assert_eq!(json["preservedAnnotationCount"], 0);
    }

    #[test]
    fn already_uploaded_tag() {
        let outcome = UploadOutcome::AlreadyUploaded {
            project_name: "a".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "alreadyUploaded");
    }

    #[test]
    fn record_skip_keeps_sums_consistent() {
        let mut stats = ExtractionStats::default();
        stats.record_skip(SkipReason::DeniedExtension);
        stats.record_skip(SkipReason::DeniedExtension);
        stats.record_skip(SkipReason::HiddenPathSegment);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.skipped_by_reason.values().sum::<usize>(), 3);
    }
}

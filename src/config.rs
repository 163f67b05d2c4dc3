use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::archive::DEFAULT_MAX_ENTRY_BYTES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub local: Option<LocalStorageConfig>,
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

fn default_backend() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalStorageConfig {
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Address the bucket as `<endpoint>/<bucket>/<key>` instead of as a
    /// subdomain. Required by MinIO.
    #[serde(default = "default_path_style")]
    pub path_style: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles on each further attempt.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_create_bucket")]
    pub create_bucket: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_path_style() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_create_bucket() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }
}

fn default_max_entry_bytes() -> u64 {
    DEFAULT_MAX_ENTRY_BYTES
}

/// Which storage backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    S3,
}

impl StorageConfig {
    pub fn kind(&self) -> Result<BackendKind> {
        match self.backend.as_str() {
            "local" => Ok(BackendKind::Local),
            "s3" => Ok(BackendKind::S3),
            other => anyhow::bail!(
                "Unknown storage backend: '{}'. Must be local or s3.",
                other
            ),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.ingest.max_entry_bytes == 0 {
        anyhow::bail!("ingest.max_entry_bytes must be > 0");
    }

    match config.storage.kind()? {
        BackendKind::Local => {
            if config.storage.local.is_none() {
                anyhow::bail!("storage.local.base_dir must be set when backend is 'local'");
            }
        }
        BackendKind::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[storage.s3] must be set when backend is 's3'"))?;
            if s3.bucket.trim().is_empty() {
                anyhow::bail!("storage.s3.bucket must not be empty");
            }
            if s3.region.trim().is_empty() {
                anyhow::bail!("storage.s3.region must not be empty");
            }
        }
    }

    Ok(())
}

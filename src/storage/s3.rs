//! S3-compatible object-store backend.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! so it works against AWS, MinIO, and LocalStack alike. Uses only
//! pure-Rust dependencies (`hmac`, `sha2`) for signing.
//!
//! # Key layout
//!
//! ```text
//! staged-archives/<file>.zip
//! projects/<name>/<relative-path>
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//!
//! [storage.s3]
//! bucket = "projects"
//! region = "us-east-1"
//! endpoint_url = "http://localhost:9000"   # MinIO
//! path_style = true
//! ```
//!
//! Credentials are read from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
//! and, optionally, `AWS_SESSION_TOKEN`.
//!
//! # Commits
//!
//! There is no atomic prefix swap in S3. A commit deletes every object
//! under `projects/<name>/` and then uploads the new tree. Once the first
//! delete has been issued, any failure is reported as
//! [`IngestError::PartialCommit`]; the prefix is left as the failure found
//! it and the registry still holds the previous hash.
//!
//! # Retries
//!
//! Network errors, HTTP 429, and 5xx responses are retried with
//! exponential backoff (`retry_base_ms`, doubling, up to `max_retries`).
//! Other 4xx responses fail immediately.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use super::{
    validate_project_name, validate_relative_path, CommitMode, LocalArchive, LocalTree,
    StagedArchive, StorageBackend,
};
use crate::config::S3StorageConfig;
use crate::error::{IngestError, Result};
use crate::hasher;
use crate::models::StorageLocation;

const STAGED_PREFIX: &str = "staged-archives/";
const PROJECTS_PREFIX: &str = "projects/";

type HmacSha256 = Hmac<Sha256>;

// ============ Credentials ============

/// AWS credentials used to sign every request.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            IngestError::storage("AWS_ACCESS_KEY_ID environment variable not set")
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            IngestError::storage("AWS_SECRET_ACCESS_KEY environment variable not set")
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self::new(access_key_id, secret_access_key, session_token))
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

// ============ Backend ============

pub struct ObjectStorageBackend {
    client: reqwest::Client,
    creds: AwsCredentials,
    bucket: String,
    region: String,
    scheme: String,
    /// Host (and port) requests are sent to, bucket subdomain included
    /// for virtual-host addressing.
    host: String,
    path_style: bool,
    max_retries: u32,
    retry_base: Duration,
}

/// Metadata for a single object, parsed from a `ListObjectsV2` response.
#[derive(Debug, Clone, PartialEq, Eq)]
struct S3Object {
    key: String,
    size: u64,
}

impl ObjectStorageBackend {
    pub fn new(config: &S3StorageConfig, creds: AwsCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(IngestError::storage)?;

        let (scheme, host) = match config.endpoint_url {
            Some(ref endpoint) => {
                let (scheme, rest) = match endpoint.split_once("://") {
                    Some((scheme, rest)) => (scheme.to_string(), rest),
                    None => ("https".to_string(), endpoint.as_str()),
                };
                let host = rest.trim_end_matches('/').to_string();
                if config.path_style {
                    (scheme, host)
                } else {
                    (scheme, format!("{}.{}", config.bucket, host))
                }
            }
            None if config.path_style => {
                ("https".to_string(), format!("s3.{}.amazonaws.com", config.region))
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
            ),
        };

        Ok(Self {
            client,
            creds,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            scheme,
            host,
            path_style: config.path_style,
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        })
    }

    fn project_prefix(name: &str) -> String {
        format!("{}{}/", PROJECTS_PREFIX, name)
    }

    /// Canonical URI path for `key`; an empty key addresses the bucket.
    fn canonical_path(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match (self.path_style, key.is_empty()) {
            (true, true) => format!("/{}", self.bucket),
            (true, false) => format!("/{}/{}", self.bucket, encoded_key),
            (false, _) => format!("/{}", encoded_key),
        }
    }

    /// Send a signed request, retrying transient failures.
    ///
    /// Returns the first response that is neither 429 nor 5xx; callers
    /// inspect its status. The body is hashed once and shared across
    /// attempts.
    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let payload_hash = hex_sha256(&body);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry_base * (1u32 << (attempt - 1).min(5));
                debug!(attempt, ?delay, key, "retrying S3 request");
                tokio::time::sleep(delay).await;
            }

            let request =
                self.signed_request(method.clone(), key, query, &body, &payload_hash)?;
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        warn!(%status, key, "transient S3 error");
                        last_err = Some(IngestError::storage(format!(
                            "S3 {} {} failed (HTTP {}): {}",
                            method,
                            key,
                            status,
                            truncate(&text)
                        )));
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    warn!(error = %e, key, "S3 request failed");
                    last_err = Some(IngestError::storage(format!(
                        "S3 {} {} failed: {}",
                        method, key, e
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| IngestError::storage("S3 request failed after retries")))
    }

    fn signed_request(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        body: &Bytes,
        payload_hash: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical query string must be sorted.
        let mut sorted_params = query.to_vec();
        sorted_params.sort();
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_uri = self.canonical_path(key);

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut builder = self
            .client
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }

    /// Create the bucket if a `HEAD` on it reports 404.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let head = self.send(Method::HEAD, "", &[], Bytes::new()).await?;
        if head.status().is_success() {
            return Ok(());
        }
        if head.status() != StatusCode::NOT_FOUND {
            return Err(IngestError::storage(format!(
                "S3 HeadBucket on '{}' failed (HTTP {})",
                self.bucket,
                head.status()
            )));
        }

        let body = if self.region == "us-east-1" {
            String::new()
        } else {
            format!(
                "<CreateBucketConfiguration><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            )
        };
        let resp = self.send(Method::PUT, "", &[], Bytes::from(body)).await?;
        expect_success(resp, "CreateBucket", &self.bucket).await?;
        info!(bucket = %self.bucket, "created bucket");
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        let resp = self.send(Method::PUT, key, &[], body).await?;
        expect_success(resp, "PutObject", key).await?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let resp = self.send(Method::DELETE, key, &[], Bytes::new()).await?;
        // Deleting a missing key is not an error in S3.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success(resp, "DeleteObject", key).await?;
        Ok(())
    }

    /// Stream an object into `out` chunk by chunk.
    async fn download_to(&self, key: &str, out: &mut impl Write, path: &Path) -> Result<u64> {
        let resp = self.send(Method::GET, key, &[], Bytes::new()).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(IngestError::NotFound(format!("s3://{}/{}", self.bucket, key)));
        }
        let mut resp = expect_success(resp, "GetObject", key).await?;

        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| IngestError::storage(format!("reading s3 object '{}': {}", key, e)))?
        {
            out.write_all(&chunk).map_err(|e| IngestError::io(path, e))?;
            written += chunk.len() as u64;
        }
        out.flush().map_err(|e| IngestError::io(path, e))?;
        Ok(written)
    }

    /// List every object under `prefix`, following continuation tokens.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<S3Object>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.send(Method::GET, "", &query, Bytes::new()).await?;
            let resp = expect_success(resp, "ListObjectsV2", prefix).await?;
            let xml = resp.text().await.map_err(IngestError::storage)?;

            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml);
            objects.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }
}

#[async_trait]
impl StorageBackend for ObjectStorageBackend {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn stage_archive(&self, file_name: &str, bytes: Vec<u8>) -> Result<StagedArchive> {
        validate_project_name(file_name)?;
        let key = format!("{}{}", STAGED_PREFIX, file_name);
        let size = bytes.len() as u64;
        self.put_object(&key, Bytes::from(bytes)).await?;
        debug!(bucket = %self.bucket, key = %key, bytes = size, "archive staged");
        Ok(StagedArchive {
            file_name: file_name.to_string(),
            size,
        })
    }

    async fn materialize_archive(&self, staged: &StagedArchive) -> Result<LocalArchive> {
        let key = format!("{}{}", STAGED_PREFIX, staged.file_name);
        let mut file = NamedTempFile::new().map_err(|e| IngestError::io(std::env::temp_dir(), e))?;
        let path = file.path().to_path_buf();
        let bytes = self.download_to(&key, file.as_file_mut(), &path).await?;
        debug!(key = %key, bytes, "archive downloaded");
        Ok(LocalArchive::temporary(file))
    }

    fn project_location(&self, name: &str) -> StorageLocation {
        StorageLocation::Object {
            bucket: self.bucket.clone(),
            prefix: Self::project_prefix(name),
        }
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .list_objects(PROJECTS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|obj| {
                obj.key
                    .strip_prefix(PROJECTS_PREFIX)
                    .and_then(|rest| rest.split_once('/'))
                    .map(|(name, _)| name.to_string())
            })
            .filter(|name| !name.is_empty())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn commit_project(
        &self,
        name: &str,
        content_root: &Path,
        mode: CommitMode,
    ) -> Result<()> {
        validate_project_name(name)?;
        let prefix = Self::project_prefix(name);

        let root = content_root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || hasher::collect_files(&root))
            .await
            .map_err(|e| IngestError::storage(format!("blocking task failed: {}", e)))??;

        let existing = self.list_objects(&prefix).await?;
        if !existing.is_empty() && mode == CommitMode::Create {
            warn!(project = name, objects = existing.len(), "unregistered objects under prefix; replacing them");
        }

        let partial = |reason: String| IngestError::PartialCommit {
            project: name.to_string(),
            reason,
        };

        for obj in &existing {
            self.delete_object(&obj.key)
                .await
                .map_err(|e| partial(format!("deleting '{}': {}", obj.key, e)))?;
        }
        let touched = !existing.is_empty();

        for (uploaded, file) in files.iter().enumerate() {
            let key = format!("{}{}", prefix, file.relative);
            let result = match tokio::fs::read(&file.path).await {
                Ok(body) => self.put_object(&key, Bytes::from(body)).await,
                Err(e) => Err(IngestError::io(&file.path, e)),
            };
            if let Err(e) = result {
                if touched || uploaded > 0 {
                    return Err(partial(format!("uploading '{}': {}", key, e)));
                }
                return Err(e);
            }
        }

        info!(
            project = name,
            bucket = %self.bucket,
            removed = existing.len(),
            uploaded = files.len(),
            ?mode,
            "project committed"
        );
        Ok(())
    }

    async fn delete_project(&self, name: &str) -> Result<bool> {
        validate_project_name(name)?;
        let objects = self.list_objects(&Self::project_prefix(name)).await?;
        for obj in &objects {
            self.delete_object(&obj.key).await?;
        }
        Ok(!objects.is_empty())
    }

    async fn list_project_files(&self, name: &str) -> Result<Vec<String>> {
        validate_project_name(name)?;
        let prefix = Self::project_prefix(name);
        let mut files: Vec<String> = self
            .list_objects(&prefix)
            .await?
            .into_iter()
            .filter_map(|obj| obj.key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        files.sort();
        Ok(files)
    }

    async fn read_project_file(&self, name: &str, relative_path: &str) -> Result<Vec<u8>> {
        validate_project_name(name)?;
        validate_relative_path(relative_path)?;
        let key = format!("{}{}", Self::project_prefix(name), relative_path);
        let mut buf = Vec::new();
        self.download_to(&key, &mut buf, Path::new(&key)).await?;
        Ok(buf)
    }

    async fn materialize_project(&self, name: &str) -> Result<Option<LocalTree>> {
        validate_project_name(name)?;
        let prefix = Self::project_prefix(name);
        let objects = self.list_objects(&prefix).await?;
        if objects.is_empty() {
            return Ok(None);
        }

        let dir = TempDir::new().map_err(|e| IngestError::io(std::env::temp_dir(), e))?;
        let mut total = 0u64;
        for obj in &objects {
            let Some(relative) = obj.key.strip_prefix(&prefix) else {
                continue;
            };
            // Keys come from the bucket, not from us; resolve them like
            // archive entries so a crafted key cannot escape the temp dir.
            let path = crate::archive::resolve_entry(dir.path(), relative)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, e))?;
            }
            let mut file = std::fs::File::create(&path).map_err(|e| IngestError::io(&path, e))?;
            total += self.download_to(&obj.key, &mut file, &path).await?;
        }

        let listed: u64 = objects.iter().map(|o| o.size).sum();
        if listed != total {
            warn!(project = name, listed, downloaded = total, "object sizes changed during download");
        }
        debug!(project = name, objects = objects.len(), bytes = total, "project materialized");
        Ok(Some(LocalTree::temporary(dir)))
    }
}

async fn expect_success(resp: reqwest::Response, op: &str, key: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(IngestError::storage(format!(
        "S3 {} failed (HTTP {}) for '{}': {}",
        op,
        status,
        key,
        truncate(&body)
    )))
}

fn truncate(body: &str) -> String {
    body.chars().take(500).collect()
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| IngestError::storage(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` as-is.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ XML Parsing (minimal, no extra deps) ============

/// Parse a `ListObjectsV2` response into objects, the truncation flag, and
/// the next continuation token.
fn parse_list_objects_response(xml: &str) -> (Vec<S3Object>, bool, Option<String>) {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        // Folder markers carry no content.
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        objects.push(S3Object { key, size });
    }

    (objects, is_truncated, next_token)
}

/// Text content of the first `<tag>` (simple, non-nested), entity-decoded.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml_unescape(&xml[start..start + end]))
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

//! Durable snapshot storage + HTTP fetch utilities for Scout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-storage";

/// Outcome of storing one object. `deduplicated` is set when the key already
/// held content and the write was skipped rather than overwriting.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Durable bucket/key object storage consumed by the pipeline.
///
/// `upload` never overwrites: an existing key is reported as deduplicated.
/// `download` distinguishes an absent key (`Ok(None)`) from a storage failure
/// (`Err`), which callers treat very differently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> anyhow::Result<bool>;
    async fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) -> anyhow::Result<StoredObject>;
    async fn download(&self, bucket: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Filesystem-backed object store: buckets are directories under `root`,
/// keys are relative paths. Writes go through a temp file + atomic rename.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        let path = self.object_path(bucket, key);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking object path {}", path.display()))
    }

    async fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) -> anyhow::Result<StoredObject> {
        let content_hash = sha256_hex(bytes);
        let path = self.object_path(bucket, key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating object directory {}", parent.display()))?;
        }

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking object path {}", path.display()))?
        {
            return Ok(StoredObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_hash,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_hash,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredObject {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    content_hash,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp object {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    async fn download(&self, bucket: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.object_path(bucket, key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading object file {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures with exponential backoff.
    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn object_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn upload_never_overwrites_an_existing_key() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        let first = store
            .upload("register", "snapshots/2025-04-15.csv", b"Organisation Name,Town/City")
            .await
            .expect("first upload");
        let second = store
            .upload("register", "snapshots/2025-04-15.csv", b"different bytes")
            .await
            .expect("second upload");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);

        let kept = store
            .download("register", "snapshots/2025-04-15.csv")
            .await
            .expect("download")
            .expect("present");
        assert_eq!(kept, b"Organisation Name,Town/City");
    }

    #[tokio::test]
    async fn download_reports_absent_keys_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        let missing = store
            .download("register", "snapshots/never-uploaded.csv")
            .await
            .expect("download");
        assert!(missing.is_none());
        assert!(!store
            .exists("register", "snapshots/never-uploaded.csv")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn exists_sees_uploaded_keys() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        store
            .upload("register", "snapshots/file.csv", b"abc")
            .await
            .expect("upload");
        assert!(store
            .exists("register", "snapshots/file.csv")
            .await
            .expect("exists"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn too_many_requests_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}

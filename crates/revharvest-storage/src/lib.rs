//! Atomic document persistence + HTTP page fetching for revharvest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revharvest-storage";

/// Receipt for a document that reached its destination path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenDocument {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// A fully written and synced temp file next to its destination, not yet renamed.
#[derive(Debug)]
pub struct StagedDocument {
    temp_path: PathBuf,
    dest: PathBuf,
    sha256: String,
    byte_size: usize,
}

impl StagedDocument {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Atomically renames the temp file over the destination.
    pub async fn commit(self) -> anyhow::Result<WrittenDocument> {
        match fs::rename(&self.temp_path, &self.dest).await {
            Ok(()) => Ok(WrittenDocument {
                path: self.dest,
                sha256: self.sha256,
                byte_size: self.byte_size,
            }),
            Err(err) => {
                let _ = fs::remove_file(&self.temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        self.temp_path.display(),
                        self.dest.display()
                    )
                })
            }
        }
    }

    /// Discards the temp file; the destination is never touched.
    pub async fn abort(self) -> anyhow::Result<()> {
        fs::remove_file(&self.temp_path)
            .await
            .with_context(|| format!("removing staged file {}", self.temp_path.display()))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `<dir>/<YYYYMMDD_HHMMSS>.json`; names sort chronologically.
pub fn timestamped_output_path(dir: &Path, now: DateTime<Utc>) -> PathBuf {
    dir.join(format!("{}.json", now.format("%Y%m%d_%H%M%S")))
}

fn temp_sibling(dest: &Path) -> anyhow::Result<PathBuf> {
    let file_name = dest
        .file_name()
        .with_context(|| format!("destination {} has no file name", dest.display()))?
        .to_string_lossy()
        .into_owned();
    let parent = dest.parent().unwrap_or_else(|| Path::new(""));
    Ok(parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4())))
}

/// Serializes `document` as pretty JSON into a synced temp sibling of `dest`.
///
/// On any failure the temp file is removed and `dest` is left as it was.
pub async fn stage_json<T: Serialize + ?Sized>(
    dest: &Path,
    document: &T,
) -> anyhow::Result<StagedDocument> {
    let bytes = serde_json::to_vec_pretty(document)
        .with_context(|| format!("serializing document for {}", dest.display()))?;

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let temp_path = temp_sibling(dest)?;
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    Ok(StagedDocument {
        sha256: sha256_hex(&bytes),
        byte_size: bytes.len(),
        temp_path,
        dest: dest.to_path_buf(),
    })
}

/// Writes `document` to `dest` so readers only ever see the old or the new content.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    dest: &Path,
    document: &T,
) -> anyhow::Result<WrittenDocument> {
    let staged = stage_json(dest, document).await?;
    let written = staged.commit().await?;
    debug!(path = %written.path.display(), bytes = written.byte_size, "document written");
    Ok(written)
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

/// Remote browser service that returns rendered HTML for a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEndpoint {
    pub base_url: String,
    pub headless: bool,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub render: Option<RenderEndpoint>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            render: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential page fetcher; one instance is owned by one crawl run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    render: Option<RenderEndpoint>,
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
            backoff: config.backoff,
            render: config.render.map(|r| RenderEndpoint {
                base_url: r.base_url.trim_end_matches('/').to_string(),
                headless: r.headless,
            }),
        })
    }

    pub fn render_endpoint(&self) -> Option<&RenderEndpoint> {
        self.render.as_ref()
    }

    /// Confirms the rendering service answers at all; plain HTTP mode is always ready.
    pub async fn ready(&self) -> Result<(), FetchError> {
        let Some(render) = &self.render else {
            return Ok(());
        };
        self.client.get(&render.base_url).send().await?;
        Ok(())
    }

    fn build_request(&self, url: &str) -> reqwest::RequestBuilder {
        match &self.render {
            Some(render) => self
                .client
                .post(format!("{}/content", render.base_url))
                .json(&serde_json::json!({
                    "url": url,
                    "launch": { "headless": render.headless },
                })),
            None => self.client.get(url),
        }
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, rendered = self.render.is_some());
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.build_request(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

//! Outbound HTTP with bounded retry, raw response archiving, and the grant
//! record store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod store;

pub use reqwest::StatusCode;
pub use store::{GrantStore, ImportPolicy, InMemoryGrantStore, PgGrantStore, StoreError, UpsertOutcome};

pub const CRATE_NAME: &str = "gdp-storage";

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_archived: bool,
}

/// Hash-addressed, write-once archive of raw adapter responses.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path_for(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.json"))
    }

    /// Writes the body through a temp file and rename so readers never observe
    /// a partial response. Identical bodies in the same second share a path.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedResponse> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.relative_path_for(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |already_archived| ArchivedResponse {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: body.len(),
            already_archived,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming {} -> {}", temp_path.display(), absolute_path.display())
                })
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
    /// One retry: government APIs are flaky but the whole run has a deadline.
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One outbound call an adapter wants made.
#[derive(Debug, Clone)]
pub enum OutboundRequest {
    Get {
        url: String,
        query: Vec<(String, String)>,
    },
    PostJson {
        url: String,
        body: serde_json::Value,
    },
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>, query: Vec<(String, String)>) -> Self {
        OutboundRequest::Get {
            url: url.into(),
            query,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        OutboundRequest::PostJson {
            url: url.into(),
            body,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            OutboundRequest::Get { url, .. } | OutboundRequest::PostJson { url, .. } => url,
        }
    }

    fn method(&self) -> &'static str {
        match self {
            OutboundRequest::Get { .. } => "GET",
            OutboundRequest::PostJson { .. } => "POST",
        }
    }

    fn build(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        match self {
            OutboundRequest::Get { url, query } => client.get(url).query(query),
            OutboundRequest::PostJson { url, body } => client.post(url).json(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http fetcher is shut down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn send(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &OutboundRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!(
            "http_fetch",
            %run_id,
            source_id,
            method = request.method(),
            url = request.url()
        );
        self.send_with_retry(request).instrument(span).await
    }

    async fn send_with_retry(&self, request: &OutboundRequest) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match request.build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            fetched_at: Utc::now(),
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, "retryable status; backing off");
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
                        warn!(error = %err, attempt, "retryable request error; backing off");
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

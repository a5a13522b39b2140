//! HTTP transport and the on-disk bulletin cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
pub use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use spimex_core::{bulletin_file_name, BulletinLink};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

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

/// Retry policy. `max_retries = 0` (the default) performs exactly one attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
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
    pub user_agent: String,
    /// Skip TLS certificate verification for this client only.
    pub accept_invalid_certs: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_invalid_certs: true,
            backoff: BackoffPolicy::default(),
        }
    }
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
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Other(String),
}

/// Anything that can GET a URL. The pipeline and locator take this so tests can
/// serve fixtures without a network.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("building reqwest client")?;

        if config.accept_invalid_certs {
            warn!("TLS certificate verification is disabled for the bulletin HTTP client");
        }

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(bytes = body.len(), %status, "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable status, backing off");
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
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "transport error, backing off");
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

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }
}

#[derive(Debug, Clone)]
pub struct CachedBulletin {
    pub path: PathBuf,
    /// True when the file was already on disk and no request was made.
    pub reused: bool,
    pub content_hash: Option<String>,
    pub byte_size: Option<usize>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> CacheError {
    move |source| CacheError::Io { context, source }
}

/// Download directory keyed by trade date. A file that already exists is never re-fetched.
#[derive(Debug, Clone)]
pub struct BulletinCache {
    root: PathBuf,
}

impl BulletinCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, trade_date: NaiveDate) -> PathBuf {
        self.root.join(bulletin_file_name(trade_date))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn ensure_root(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(format!("creating {}", self.root.display())))
    }

    pub async fn fetch(
        &self,
        http: &dyn ResourceFetcher,
        link: &BulletinLink,
    ) -> Result<CachedBulletin, CacheError> {
        let path = self.path_for(link.trade_date);

        if fs::try_exists(&path)
            .await
            .map_err(io_err(format!("checking {}", path.display())))?
        {
            info!(path = %path.display(), "bulletin already cached, skipping download");
            return Ok(CachedBulletin {
                path,
                reused: true,
                content_hash: None,
                byte_size: None,
            });
        }

        let response = http.fetch_bytes(&link.url).await?;
        self.ensure_root().await?;
        self.write_atomically(&path, &response.body).await?;

        let content_hash = Self::sha256_hex(&response.body);
        info!(path = %path.display(), bytes = response.body.len(), %content_hash, "bulletin downloaded");
        Ok(CachedBulletin {
            path,
            reused: false,
            content_hash: Some(content_hash),
            byte_size: Some(response.body.len()),
        })
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(format!("opening temp file {}", temp_path.display())))?;
        file.write_all(bytes)
            .await
            .map_err(io_err(format!("writing temp file {}", temp_path.display())))?;
        file.flush()
            .await
            .map_err(io_err(format!("flushing temp file {}", temp_path.display())))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::Io {
                context: format!("renaming {} -> {}", temp_path.display(), path.display()),
                source: err,
            });
        }
        Ok(())
    }
}

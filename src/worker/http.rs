//! HTTP client for downloading media enclosures

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Timed out fetching {0}")]
    Timeout(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Too many redirects")]
    TooManyRedirects,

    #[error("Cannot write download: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download produced no file at {0}")]
    Missing(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60 * 60),
            max_retries: 3,
            user_agent: "Audrey/0.1".to_string(),
        }
    }
}

/// What a finished download left behind
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: u64,
    pub content_type: Option<String>,
}

/// HTTP downloader
pub struct HttpClient {
    client: Client,
    config: HttpConfig,
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DownloadError::RequestFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Download `url` into `dest`, retrying with backoff.
    ///
    /// A partial file is removed on failure.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<Downloaded> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.download_once(url, dest).await {
                Ok(downloaded) => {
                    if attempts > 1 {
                        debug!(url, attempts, "Download succeeded after retry");
                    }
                    return Ok(downloaded);
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(dest).await;

                    if attempts >= self.config.max_retries.max(1) {
                        warn!(url, attempts, error = %e, "Download failed after retries");
                        return Err(e);
                    }

                    warn!(url, attempts, error = %e, "Download failed, retrying");

                    // Exponential backoff: 1s, 2s, 4s
                    let backoff = Duration::from_secs(2u64.pow(attempts - 1));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<Downloaded> {
        debug!(url, "Starting download");

        let parsed = reqwest::Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
        let mut response = self.client.get(parsed).send().await.map_err(|e| classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::RequestFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut file = File::create(dest).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(url, e))? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.sync_all().await?;

        debug!(url, bytes, "Download completed");

        Ok(Downloaded {
            bytes,
            content_type,
        })
    }
}

fn classify(url: &str, e: reqwest::Error) -> DownloadError {
    if e.is_timeout() {
        DownloadError::Timeout(url.to_string())
    } else if e.is_redirect() {
        DownloadError::TooManyRedirects
    } else {
        DownloadError::RequestFailed(e.to_string())
    }
}

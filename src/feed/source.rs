//! Conditional feed retrieval

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Timed out retrieving feed at {0}")]
    Timeout(String),

    #[error("Got error status code {status} retrieving feed at {url}")]
    Status { status: u16, url: String },

    #[error("Unable to retrieve feed at {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Unable to parse feed at {url}: {message}")]
    Parse { url: String, message: String },

    #[error("Too many redirects retrieving feed at {0}")]
    TooManyRedirects(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Feed URL plus cache validators from the previous successful poll
#[derive(Debug, Clone)]
pub struct ConditionalRequest {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// One parsed entry. Any field may be missing in a malformed feed.
#[derive(Debug, Clone, Default)]
pub struct RawEntry {
    pub published: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub enclosure: Option<String>,
}

/// Outcome of a non-failing retrieval (2xx or 304)
#[derive(Debug, Clone, Default)]
pub struct FeedResponse {
    pub status: u16,
    /// Set when every hop to the final URL was a permanent redirect
    pub permanent_redirect: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub title: Option<String>,
    pub entries: Vec<RawEntry>,
}

impl FeedResponse {
    pub fn not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

/// Anything that can answer a conditional feed request.
///
/// Timeouts and 4xx/5xx statuses are reported as errors.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, request: &ConditionalRequest) -> Result<FeedResponse>;
}

/// HTTP client configuration for feed polling
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: "Audrey/0.1".to_string(),
            max_redirects: 10,
        }
    }
}

/// reqwest + feed-rs implementation of [`FeedSource`]
pub struct HttpFeedSource {
    client: Client,
    config: FeedClientConfig,
}

impl HttpFeedSource {
    pub fn new(config: FeedClientConfig) -> Result<Self> {
        // Redirects are followed by hand so permanent moves can be recorded
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FeedError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self { client, config })
    }

    fn map_send_error(url: &str, e: reqwest::Error) -> FeedError {
        if e.is_timeout() {
            FeedError::Timeout(url.to_string())
        } else {
            FeedError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, request: &ConditionalRequest) -> Result<FeedResponse> {
        let mut url = reqwest::Url::parse(&request.url).map_err(|e| FeedError::Transport {
            url: request.url.clone(),
            message: e.to_string(),
        })?;
        let mut all_permanent = true;
        let mut redirects = 0;

        let response = loop {
            let mut req = self.client.get(url.clone());
            if let Some(etag) = &request.etag {
                req = req.header(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = &request.last_modified {
                req = req.header(IF_MODIFIED_SINCE, modified);
            }

            let response = req
                .send()
                .await
                .map_err(|e| Self::map_send_error(url.as_str(), e))?;

            let status = response.status();
            if !status.is_redirection() || status == StatusCode::NOT_MODIFIED {
                break response;
            }

            redirects += 1;
            if redirects > self.config.max_redirects {
                return Err(FeedError::TooManyRedirects(request.url.clone()));
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| url.join(loc).ok())
                .ok_or_else(|| FeedError::Transport {
                    url: url.to_string(),
                    message: format!("redirect {} without a usable Location", status.as_u16()),
                })?;

            all_permanent &= matches!(
                status,
                StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
            );
            debug!(from = %url, to = %location, status = status.as_u16(), "Following feed redirect");
            url = location;
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let mut feed_response = FeedResponse {
            status: status.as_u16(),
            permanent_redirect: (redirects > 0 && all_permanent).then(|| url.to_string()),
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
            ..FeedResponse::default()
        };

        if feed_response.not_modified() {
            return Ok(feed_response);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_send_error(url.as_str(), e))?;
        let feed = feed_rs::parser::parse(body.as_ref()).map_err(|e| FeedError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        feed_response.title = feed.title.map(|t| t.content);
        feed_response.entries = feed.entries.into_iter().map(raw_entry).collect();
        Ok(feed_response)
    }
}

/// First enclosure URL: RSS `<enclosure>` (surfaced as media content) or an
/// Atom `rel="enclosure"` link.
fn raw_entry(entry: feed_rs::model::Entry) -> RawEntry {
    let media_url = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .find_map(|c| c.url.as_ref().map(|u| u.to_string()));
    let link_url = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("enclosure"))
        .map(|l| l.href.clone());

    RawEntry {
        published: entry.published.or(entry.updated),
        title: entry.title.map(|t| t.content).filter(|t| !t.trim().is_empty()),
        enclosure: media_url.or(link_url),
    }
}

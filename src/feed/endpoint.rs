//! Per-feed state records kept in the working directory
//!
//! - `feedchk-url-<name>`: the feed URL (rewritten on permanent redirect)
//! - `feedchk-status-<name>`: three lines, each `None` when unset:
//!   cache token (ETag), cache timestamp (Last-Modified), last-seen entry (RFC 3339)

use crate::queue::{DirQueue, QueueError};
use chrono::{DateTime, Utc};
use std::io;

pub const URL_PREFIX: &str = "feedchk-url-";
pub const STATUS_PREFIX: &str = "feedchk-status-";

const UNSET: &str = "None";

/// Cursor state for one feed, mutated only after a successful poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_entry: Option<DateTime<Utc>>,
}

impl FeedState {
    /// Parse the three-line record. Missing or unparsable lines read as unset.
    pub fn parse(text: &str) -> Self {
        let mut lines = text.lines().map(str::trim);
        let mut field = || {
            lines
                .next()
                .filter(|line| !line.is_empty() && *line != UNSET)
                .map(str::to_string)
        };

        let etag = field();
        let last_modified = field();
        let last_entry = field().and_then(|line| {
            DateTime::parse_from_rfc3339(&line)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        });

        Self {
            etag,
            last_modified,
            last_entry,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.etag.as_deref().unwrap_or(UNSET),
            self.last_modified.as_deref().unwrap_or(UNSET),
            self.last_entry
                .map(|dt| dt.to_rfc3339())
                .as_deref()
                .unwrap_or(UNSET),
        )
    }
}

/// A configured feed and its persisted cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoint {
    pub name: String,
    pub url: String,
    pub state: FeedState,
}

impl FeedEndpoint {
    /// Endpoint names, sorted, from `feedchk-url-*` files
    pub fn list(queue: &DirQueue) -> Result<Vec<String>, QueueError> {
        let dir = queue.dir();
        let mut names = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|source| QueueError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| QueueError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|f| f.strip_prefix(URL_PREFIX))
                .filter(|n| !n.is_empty())
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load(queue: &DirQueue, name: &str) -> Result<Self, QueueError> {
        let url_bytes = queue.read(&format!("{}{}", URL_PREFIX, name))?;
        let url = String::from_utf8_lossy(&url_bytes).trim().to_string();
        if url.is_empty() {
            return Err(QueueError::InvalidName(format!("{}{} is empty", URL_PREFIX, name)));
        }

        let state = match queue.read(&format!("{}{}", STATUS_PREFIX, name)) {
            Ok(bytes) => FeedState::parse(&String::from_utf8_lossy(&bytes)),
            Err(QueueError::NotFound(_)) => FeedState::default(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            name: name.to_string(),
            url,
            state,
        })
    }

    /// Create the URL file unless one already exists. Returns true if written.
    pub fn seed(queue: &DirQueue, name: &str, url: &str) -> Result<bool, QueueError> {
        let file_name = format!("{}{}", URL_PREFIX, name);
        match std::fs::metadata(queue.path_of(&file_name)) {
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::write_url(queue, name, url)?;
                Ok(true)
            }
            Err(source) => Err(QueueError::Io {
                path: queue.path_of(&file_name),
                source,
            }),
        }
    }

    pub fn write_url(queue: &DirQueue, name: &str, url: &str) -> Result<(), QueueError> {
        queue.write_atomic(&format!("{}{}", URL_PREFIX, name), format!("{}\n", url).as_bytes())
    }

    pub fn save_state(&self, queue: &DirQueue) -> Result<(), QueueError> {
        queue.write_atomic(
            &format!("{}{}", STATUS_PREFIX, self.name),
            self.state.render().as_bytes(),
        )
    }
}

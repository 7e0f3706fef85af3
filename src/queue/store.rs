use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Files with this prefix are invisible to every consumer
pub const TEMP_PREFIX: &str = "temp-";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Queue item not found: {0}")]
    NotFound(String),

    #[error("Invalid queue item name: {0}")]
    InvalidName(String),

    #[error("Payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> QueueError + '_ {
    move |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Hand-off point between two adjacent pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Feed-check → fetch
    FetchDescriptor,
    /// Fetch → build
    BuildItem,
    /// Build → burn
    BurnJob,
}

impl Stage {
    pub fn prefix(&self) -> &'static str {
        match self {
            Stage::FetchDescriptor => "fetch-desc-",
            Stage::BuildItem => "isobuild-item-",
            Stage::BurnJob => "discburn-iso-",
        }
    }

    /// Strips the stage prefix from a visible item name
    pub fn item_label<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(self.prefix())
    }
}

/// A visible queue item with the filesystem facts consumers need
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Time since the item was published
    pub age: Duration,
}

/// DirQueue: a directory of uniquely named files, published by atomic rename
///
/// Layout:
/// - `temp-*`: in-progress writes, deleted by [`DirQueue::recover`]
/// - `<stage prefix><label>`: visible items, consumed in lexicographic order
///
/// Generated labels start with a UTC timestamp followed by a per-handle
/// sequence number, so lexicographic order is creation order and two
/// publishes within one clock tick never collide. Consumption is
/// at-least-once: deleting the item is the commit point.
///
/// Every method is synchronous `std::fs`. Listing, renames, links and
/// deletes are metadata operations and are called inline from async code;
/// writes that fsync should go through [`DirQueue::blocking`]. Clones share
/// the sequence counter.
#[derive(Debug, Clone)]
pub struct DirQueue {
    dir: PathBuf,
    seq: Arc<AtomicU64>,
}

impl DirQueue {
    /// Open (creating if needed) the queue directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        debug!("Opened queue directory: {}", dir.display());

        Ok(Self {
            dir,
            seq: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Delete temp files orphaned by a crash.
    ///
    /// Must run before any worker starts; assumes no concurrent writer.
    pub fn recover(&self) -> Result<usize> {
        let mut removed = 0;
        for name in self.list_names()? {
            if name.starts_with(TEMP_PREFIX) {
                let path = self.path_of(&name);
                fs::remove_file(&path).map_err(io_err(&path))?;
                warn!(name, "Removed orphaned temp file");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Queue recovery complete");
        }
        Ok(removed)
    }

    /// Run `op` against this queue on tokio's blocking pool
    pub async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&DirQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| QueueError::Io {
                path: self.dir.clone(),
                source: io::Error::other(e),
            })?
    }

    /// Fresh temp path; `suffix` is appended verbatim (e.g. `".iso"`)
    pub fn temp_path(&self, suffix: &str) -> PathBuf {
        self.path_of(&format!("{}{}{}", TEMP_PREFIX, Uuid::new_v4(), suffix))
    }

    /// Timestamp-ordered unique label, `tag` appended for humans
    pub fn next_label(&self, tag: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        if tag.is_empty() {
            format!("{}-{:06}", stamp, seq)
        } else {
            format!("{}-{:06}-{}", stamp, seq, tag)
        }
    }

    /// Serialize `payload` and publish it under a fresh unique name
    pub fn publish<T: serde::Serialize>(&self, stage: Stage, tag: &str, payload: &T) -> Result<String> {
        let bytes = serde_json::to_vec_pretty(payload)?;
        self.publish_bytes(stage, tag, &bytes)
    }

    /// Write `bytes` to a temp file, sync, then rename into view
    pub fn publish_bytes(&self, stage: Stage, tag: &str, bytes: &[u8]) -> Result<String> {
        let temp = self.temp_path("");
        write_synced(&temp, bytes)?;
        self.commit_temp(stage, &temp, tag, "")
    }

    /// Rename a finished temp file into view under a fresh unique name
    /// ending in `suffix`
    pub fn commit_temp(&self, stage: Stage, temp: &Path, tag: &str, suffix: &str) -> Result<String> {
        let name = format!("{}{}{}", stage.prefix(), self.next_label(tag), suffix);
        let target = self.path_of(&name);
        fs::rename(temp, &target).map_err(io_err(temp))?;
        debug!(name, "Published queue item");
        Ok(name)
    }

    /// Publish a finished temp file under a caller-chosen label.
    ///
    /// When the name is taken, `rename_candidate(label, n)` is tried for
    /// n = 1, 2, ... until a free name is found. Publishing uses a hard link,
    /// which never replaces an existing item.
    pub fn publish_named<F>(&self, stage: Stage, temp: &Path, label: &str, rename_candidate: F) -> Result<String>
    where
        F: Fn(&str, u32) -> String,
    {
        if label.is_empty() || label.contains(['/', '\\']) {
            return Err(QueueError::InvalidName(label.to_string()));
        }

        let mut candidate = label.to_string();
        let mut n = 0;
        loop {
            let name = format!("{}{}", stage.prefix(), candidate);
            let target = self.path_of(&name);
            match fs::hard_link(temp, &target) {
                Ok(()) => {
                    fs::remove_file(temp).map_err(io_err(temp))?;
                    debug!(name, "Published queue item");
                    return Ok(name);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    n += 1;
                    candidate = rename_candidate(label, n);
                }
                Err(e) => return Err(io_err(temp)(e)),
            }
        }
    }

    /// Visible item names for `stage`, sorted (creation order for generated labels)
    pub fn list_pending(&self, stage: Stage) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list_names()?
            .into_iter()
            .filter(|name| name.starts_with(stage.prefix()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Visible items with size and age since publication
    pub fn pending_items(&self, stage: Stage) -> Result<Vec<PendingItem>> {
        let now = SystemTime::now();
        let mut items = Vec::new();

        for name in self.list_pending(stage)? {
            let path = self.path_of(&name);
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                // Consumed between listing and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&path)(e)),
            };
            let modified = meta.modified().map_err(io_err(&path))?;
            items.push(PendingItem {
                name,
                path,
                size: meta.len(),
                age: now.duration_since(modified).unwrap_or_default(),
            });
        }

        Ok(items)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(name);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => QueueError::NotFound(name.to_string()),
            _ => io_err(&path)(e),
        })
    }

    pub fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let bytes = self.read(name)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Commit consumption of an item by deleting it
    pub fn consume(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(name, "Consumed queue item");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(QueueError::NotFound(name.to_string()))
            }
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Replace a non-queue file (endpoint records) via temp + rename
    pub fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let temp = self.temp_path("");
        write_synced(&temp, bytes)?;
        let target = self.path_of(file_name);
        fs::rename(&temp, &target).map_err(io_err(&temp))?;
        Ok(())
    }

    /// Append a line to a file in the queue directory
    pub fn append_line(&self, file_name: &str, line: &str) -> Result<()> {
        let path = self.path_of(file_name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        writeln!(file, "{}", line).map_err(io_err(&path))?;
        Ok(())
    }

    fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let entry = entry.map_err(io_err(&self.dir))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(io_err(path))?;
    file.write_all(bytes).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(())
}

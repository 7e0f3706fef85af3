use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::FetchDescriptor;
use crate::config::FeedCheckConfig;
use crate::feed::{ConditionalRequest, FeedEndpoint, FeedSource, RawEntry};
use crate::naming::display_title;
use crate::queue::{DirQueue, Stage};
use crate::worker::{Step, StepResult, WorkerContext};

#[derive(Debug, Clone)]
pub struct FeedCheckSettings {
    pub interval: Duration,
    pub max_new_per_poll: usize,
    pub prime_on_first_poll: bool,
    pub feed_title_len: usize,
    pub entry_title_len: usize,
}

impl From<&FeedCheckConfig> for FeedCheckSettings {
    fn from(config: &FeedCheckConfig) -> Self {
        Self {
            interval: config.interval.as_duration(),
            max_new_per_poll: config.max_new_per_poll,
            prime_on_first_poll: config.prime_on_first_poll,
            feed_title_len: config.feed_title_len,
            entry_title_len: config.entry_title_len,
        }
    }
}

/// An entry carrying everything needed to publish it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidEntry {
    pub published: DateTime<Utc>,
    pub title: String,
    pub enclosure: String,
}

/// Result of comparing one poll's entries against the stored cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Entries to publish, oldest first, at most `cap`
    pub publish: Vec<ValidEntry>,
    /// New entries beyond the cap
    pub dropped: usize,
    /// Entries missing a timestamp, title or enclosure
    pub malformed: usize,
    /// Cursor to persist: the newest timestamp seen, never moving backwards
    pub last_entry: Option<DateTime<Utc>>,
}

/// Pick the entries newer than `last_entry`, keeping the `cap` most recent.
///
/// With no stored cursor and `prime` set, nothing is new; the poll only
/// establishes the cursor.
pub fn select_new_entries(
    entries: &[RawEntry],
    last_entry: Option<DateTime<Utc>>,
    prime: bool,
    cap: usize,
) -> Selection {
    let mut selection = Selection {
        last_entry,
        ..Selection::default()
    };
    let mut fresh = Vec::new();

    for entry in entries {
        let (Some(published), Some(title), Some(enclosure)) =
            (entry.published, entry.title.as_ref(), entry.enclosure.as_ref())
        else {
            selection.malformed += 1;
            continue;
        };

        let is_new = match last_entry {
            Some(seen) => published > seen,
            None => !prime,
        };
        if is_new {
            fresh.push(ValidEntry {
                published,
                title: title.clone(),
                enclosure: enclosure.clone(),
            });
        }

        if selection.last_entry.is_none_or(|cursor| published > cursor) {
            selection.last_entry = Some(published);
        }
    }

    fresh.sort_by_key(|e| e.published);
    let keep_from = fresh.len().saturating_sub(cap);
    selection.dropped = keep_from;
    selection.publish = fresh.split_off(keep_from);
    selection
}

/// Polls every feed endpoint and publishes fetch descriptors for new entries
pub struct FeedCheck {
    queue: DirQueue,
    source: Arc<dyn FeedSource>,
    settings: FeedCheckSettings,
}

impl FeedCheck {
    pub fn new(queue: DirQueue, source: Arc<dyn FeedSource>, settings: FeedCheckSettings) -> Self {
        Self {
            queue,
            source,
            settings,
        }
    }

    async fn check_endpoint(&self, ctx: &mut WorkerContext, name: &str) -> StepResult {
        ctx.emit_log(format!("Reading feed endpoint {}", name));
        let mut endpoint = FeedEndpoint::load(&self.queue, name)?;

        let request = ConditionalRequest {
            url: endpoint.url.clone(),
            etag: endpoint.state.etag.clone(),
            last_modified: endpoint.state.last_modified.clone(),
        };
        // Any failure here leaves the stored state untouched for the next cycle
        let response = self.source.fetch(&request).await?;

        if let Some(etag) = response.etag.clone() {
            endpoint.state.etag = Some(etag);
        }
        if let Some(modified) = response.last_modified.clone() {
            endpoint.state.last_modified = Some(modified);
        }

        if let Some(moved_to) = &response.permanent_redirect {
            ctx.emit_log(format!(
                "Feed {} moved permanently, switching to url {}",
                name, moved_to
            ));
            let (feed, url) = (name.to_string(), moved_to.clone());
            self.queue
                .blocking(move |q| FeedEndpoint::write_url(q, &feed, &url))
                .await?;
            endpoint.url = moved_to.clone();
        }

        if response.not_modified() {
            ctx.emit_log(format!("Feed {} not modified", name));
        }

        let selection = select_new_entries(
            &response.entries,
            endpoint.state.last_entry,
            self.settings.prime_on_first_poll,
            self.settings.max_new_per_poll,
        );

        if selection.malformed > 0 {
            ctx.emit_log(format!("Skipping {} malformed entries", selection.malformed));
        }
        let found = selection.publish.len() + selection.dropped;
        if found > 0 {
            ctx.emit_log(format!("Got {} seeming to be new", found));
        }
        if selection.dropped > 0 {
            ctx.emit_log(format!(
                "Dropping {} older new entries beyond the cap of {}",
                selection.dropped, self.settings.max_new_per_poll
            ));
        }

        let feed_title = response.title.as_deref().unwrap_or(&endpoint.name);
        for entry in &selection.publish {
            let descriptor = FetchDescriptor {
                url: entry.enclosure.clone(),
                title: display_title(
                    entry.published,
                    feed_title,
                    &entry.title,
                    self.settings.feed_title_len,
                    self.settings.entry_title_len,
                ),
            };
            let tag = endpoint.name.clone();
            let written = self
                .queue
                .blocking(move |q| q.publish(Stage::FetchDescriptor, &tag, &descriptor))
                .await?;
            ctx.emit_log(format!("Wrote {}", written));
        }

        // Only after every descriptor is durable: a crash before this line
        // republishes, it never loses
        endpoint.state.last_entry = selection.last_entry;
        let record = endpoint.clone();
        self.queue.blocking(move |q| record.save_state(q)).await?;

        info!(
            feed = name,
            published = selection.publish.len(),
            dropped = selection.dropped,
            "Feed checked"
        );
        Ok(())
    }
}

#[async_trait]
impl Step for FeedCheck {
    fn name(&self) -> &'static str {
        "FeedCheck"
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> StepResult {
        // No events apply here, but the channel is still drained
        let _ = ctx.pull_event();

        ctx.emit_log("Checking feeds");
        for name in FeedEndpoint::list(&self.queue)? {
            if let Err(e) = self.check_endpoint(ctx, &name).await {
                ctx.emit_log(format!("Error with {} - {}", name, e));
            }
        }
        ctx.emit_log("Finished checking feeds");
        Ok(())
    }

    fn pause(&self) -> Duration {
        self.settings.interval
    }
}

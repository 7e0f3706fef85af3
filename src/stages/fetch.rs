use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::FetchDescriptor;
use crate::naming::{collision_candidate, extension_from_mime, extension_from_url, item_label};
use crate::queue::{DirQueue, QueueError, Stage};
use crate::worker::http::{DownloadError, HttpClient};
use crate::worker::{StageError, Step, StepResult, WorkerContext};

/// Downloads the media behind each fetch descriptor into a build item
pub struct Fetch {
    queue: DirQueue,
    client: HttpClient,
    interval: Duration,
}

impl Fetch {
    pub fn new(queue: DirQueue, client: HttpClient, interval: Duration) -> Self {
        Self {
            queue,
            client,
            interval,
        }
    }

    /// Download one descriptor's media and publish it. The descriptor is
    /// consumed only once the build item is visible.
    async fn fetch_one(&self, ctx: &mut WorkerContext, name: &str) -> StepResult {
        let descriptor: FetchDescriptor = match self.queue.read_json(name) {
            Ok(descriptor) => descriptor,
            Err(QueueError::Encode(e)) => {
                // Retrying would never succeed
                warn!(name, error = %e, "Discarding unreadable descriptor");
                ctx.emit_log(format!("Discarding unreadable descriptor {} - {}", name, e));
                self.queue.consume(name)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        ctx.emit_log(format!("Fetching {} from {}", descriptor.title, descriptor.url));
        let temp = self.queue.temp_path("");
        let downloaded = self.client.download_to(&descriptor.url, &temp).await?;

        if !tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            return Err(DownloadError::Missing(temp.display().to_string()).into());
        }

        let extension = extension_from_url(&descriptor.url).or_else(|| {
            downloaded
                .content_type
                .as_deref()
                .and_then(extension_from_mime)
        });
        let label = item_label(&descriptor.title, extension);

        let published = match self
            .queue
            .publish_named(Stage::BuildItem, &temp, &label, collision_candidate)
        {
            Ok(published) => published,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e.into());
            }
        };

        self.queue.consume(name)?;
        info!(descriptor = name, item = %published, bytes = downloaded.bytes, "Fetched");
        ctx.emit_log(format!("Wrote {} ({} bytes)", published, downloaded.bytes));
        Ok(())
    }
}

#[async_trait]
impl Step for Fetch {
    fn name(&self) -> &'static str {
        "Fetch"
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> StepResult {
        let _ = ctx.pull_event();

        for name in self.queue.list_pending(Stage::FetchDescriptor)? {
            match self.fetch_one(ctx, &name).await {
                Ok(()) => {}
                // Another handle consumed it first
                Err(StageError::Queue(QueueError::NotFound(_))) => {}
                Err(e) => {
                    ctx.emit_log(format!("Leaving {} for retry - {}", name, e));
                }
            }
        }
        Ok(())
    }

    fn pause(&self) -> Duration {
        self.interval
    }
}

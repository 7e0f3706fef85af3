use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::humanize::{ByteSize, HumanDuration};
use crate::queue::{DirQueue, PendingItem, Stage};
use crate::tools::{ImageAuthor, ImageEntry};
use crate::worker::{StageError, Step, StepResult, WorkerContext};

/// Age and size thresholds for cutting a disc image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub soft_age: Duration,
    pub soft_size: u64,
    pub hard_age: Duration,
    pub hard_size: u64,
    /// Exclusive upper bound on a batch's total size
    pub max_size: u64,
}

impl From<&BuildConfig> for BatchLimits {
    fn from(config: &BuildConfig) -> Self {
        Self {
            soft_age: config.soft_age.as_duration(),
            soft_size: config.soft_size.as_u64(),
            hard_age: config.hard_age.as_duration(),
            hard_size: config.hard_size.as_u64(),
            max_size: config.max_size.as_u64(),
        }
    }
}

/// Items picked for one image
#[derive(Debug, Clone)]
pub struct Batch {
    pub items: Vec<PendingItem>,
    pub total: u64,
    /// Age of the oldest pending item that could fit on a disc
    pub oldest_age: Duration,
}

/// Smallest first, keeping the running total strictly below `max_size`.
/// Equal sizes go oldest first.
pub fn select_candidates(items: &[PendingItem], max_size: u64) -> (Vec<PendingItem>, u64) {
    let mut sorted: Vec<&PendingItem> = items.iter().collect();
    sorted.sort_by(|a, b| a.size.cmp(&b.size).then(b.age.cmp(&a.age)));

    let mut selected = Vec::new();
    let mut total = 0u64;
    for item in sorted {
        let next = total.saturating_add(item.size);
        if next >= max_size {
            break;
        }
        total = next;
        selected.push(item.clone());
    }
    (selected, total)
}

/// Build when a large enough batch has waited a while, when anything has
/// waited too long, or when the batch is already large
pub fn should_build(oldest_age: Duration, total: u64, limits: &BatchLimits) -> bool {
    (oldest_age > limits.soft_age && total > limits.soft_size)
        || oldest_age > limits.hard_age
        || total > limits.hard_size
}

/// Plan the next image, or `None` when nothing should be built yet.
///
/// Items too large to ever fit under `max_size` take no part in planning.
pub fn plan_batch(items: &[PendingItem], limits: &BatchLimits) -> Option<Batch> {
    let fitting: Vec<PendingItem> = items
        .iter()
        .filter(|item| item.size < limits.max_size)
        .cloned()
        .collect();

    let oldest_age = fitting.iter().map(|item| item.age).max()?;
    let (selected, total) = select_candidates(&fitting, limits.max_size);

    if selected.is_empty() || !should_build(oldest_age, total, limits) {
        return None;
    }
    Some(Batch {
        items: selected,
        total,
        oldest_age,
    })
}

/// Batches build items into disc images
pub struct Build {
    queue: DirQueue,
    author: Arc<dyn ImageAuthor>,
    limits: BatchLimits,
    interval: Duration,
    warned_oversize: HashSet<String>,
}

impl Build {
    pub fn new(queue: DirQueue, author: Arc<dyn ImageAuthor>, limits: BatchLimits, interval: Duration) -> Self {
        Self {
            queue,
            author,
            limits,
            interval,
            warned_oversize: HashSet::new(),
        }
    }

    fn warn_oversize(&mut self, ctx: &WorkerContext, items: &[PendingItem]) {
        for item in items.iter().filter(|i| i.size >= self.limits.max_size) {
            if self.warned_oversize.insert(item.name.clone()) {
                warn!(item = %item.name, size = item.size, "Item can never fit on a disc");
                ctx.emit_log(format!(
                    "{} is {} and will never fit under {}",
                    item.name,
                    ByteSize(item.size),
                    ByteSize(self.limits.max_size)
                ));
            }
        }
    }

    async fn build_image(&self, ctx: &mut WorkerContext, batch: &Batch) -> StepResult {
        let entries: Vec<ImageEntry> = batch
            .items
            .iter()
            .map(|item| ImageEntry {
                name: Stage::BuildItem
                    .item_label(&item.name)
                    .unwrap_or(&item.name)
                    .to_string(),
                source: item.path.clone(),
            })
            .collect();

        let temp = self.queue.temp_path(".iso");
        if let Err(e) = self.author.author(&temp, &entries).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if !tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            return Err(StageError::Invalid(format!(
                "image tool reported success but wrote no {}",
                temp.display()
            )));
        }

        let job = self.queue.commit_temp(Stage::BurnJob, &temp, "", ".iso")?;
        for item in &batch.items {
            self.queue.consume(&item.name)?;
        }

        info!(job = %job, files = batch.items.len(), total = batch.total, "Built image");
        ctx.emit_log(format!(
            "Wrote {} with {} files ({})",
            job,
            batch.items.len(),
            ByteSize(batch.total)
        ));
        Ok(())
    }
}

#[async_trait]
impl Step for Build {
    fn name(&self) -> &'static str {
        "Build"
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> StepResult {
        let _ = ctx.pull_event();

        let items = self.queue.pending_items(Stage::BuildItem)?;
        if items.is_empty() {
            return Ok(());
        }
        self.warn_oversize(ctx, &items);

        let Some(batch) = plan_batch(&items, &self.limits) else {
            return Ok(());
        };

        ctx.emit_log(format!(
            "Building image: {} of {} items, {}, oldest {}",
            batch.items.len(),
            items.len(),
            ByteSize(batch.total),
            HumanDuration(batch.oldest_age)
        ));
        if let Err(e) = self.build_image(ctx, &batch).await {
            // Everything stays queued for the next cycle
            ctx.emit_log(format!("Image build failed - {}", e));
        }
        Ok(())
    }

    fn pause(&self) -> Duration {
        self.interval
    }
}

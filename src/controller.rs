//! Supervisor for the pipeline workers
//!
//! The controller owns every worker task and the controller side of its
//! channels. Its caller drives it by calling [`Controller::pump`]
//! periodically; nothing happens between pumps except inside the workers.

use chrono::{DateTime, Local};
use futures::FutureExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::feed::{FeedClientConfig, FeedEndpoint, FeedError, HttpFeedSource};
use crate::observability::{MetricsSnapshot, PipelineMetrics};
use crate::queue::{DirQueue, QueueError};
use crate::stages::{BatchLimits, Build, Burn, FeedCheck, FeedCheckSettings, Fetch};
use crate::tools::{CdrDrive, CdrDriveConfig, Genisoimage};
use crate::worker::http::{DownloadError, HttpClient, HttpConfig};
use crate::worker::{self, ControlEvent, Step, WorkerLink};

pub const INITIAL_STATUS: &str = "Initializing controller...";

/// Stage name used for entries the controller writes itself
const CONTROLLER_STAGE: &str = "Controller";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("feed client: {0}")]
    Feed(#[from] FeedError),

    #[error("download client: {0}")]
    Download(#[from] DownloadError),

    #[error("Worker {stage} died, all workers stopped")]
    WorkerDied { stage: &'static str },

    #[error("Controller is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// One line of the append-only log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub stage: String,
    pub message: String,
}

impl LogEntry {
    pub fn now(stage: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.stage,
            self.message
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct RunningWorker {
    link: WorkerLink,
    handle: JoinHandle<()>,
}

pub struct Controller {
    queue: DirQueue,
    log_file: String,
    pending: Vec<Box<dyn Step>>,
    workers: Vec<RunningWorker>,
    pending_event: Option<String>,
    status: String,
    phase: Phase,
    metrics: PipelineMetrics,
}

impl Controller {
    /// Open the working directory and clear temp files left by a crash.
    ///
    /// No worker may be running against `working_dir` yet.
    pub fn new<P: AsRef<Path>>(working_dir: P, log_file: impl Into<String>) -> Result<Self> {
        let queue = DirQueue::open(working_dir)?;
        queue.recover()?;

        Ok(Self {
            queue,
            log_file: log_file.into(),
            pending: Vec::new(),
            workers: Vec::new(),
            pending_event: None,
            status: INITIAL_STATUS.to_string(),
            phase: Phase::Idle,
            metrics: PipelineMetrics::new(),
        })
    }

    /// Controller with the four real stages, feeds seeded from `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let dir = config.resolved_working_dir();
        let mut controller = Self::new(&dir, config.log_file.clone())?;

        for (name, feed) in &config.feeds {
            if FeedEndpoint::seed(&controller.queue, name, &feed.url)? {
                info!(feed = %name, url = %feed.url, "Seeded feed endpoint");
            }
        }

        let source = HttpFeedSource::new(FeedClientConfig {
            timeout: config.feed.timeout.as_duration(),
            user_agent: config.feed.user_agent.clone(),
            max_redirects: config.feed.max_redirects,
        })?;
        controller.add_stage(Box::new(FeedCheck::new(
            DirQueue::open(&dir)?,
            Arc::new(source),
            FeedCheckSettings::from(&config.feed),
        )));

        let client = HttpClient::new(HttpConfig {
            connect_timeout: config.fetch.connect_timeout.as_duration(),
            request_timeout: config.fetch.timeout.as_duration(),
            max_retries: config.fetch.max_retries,
            user_agent: config.feed.user_agent.clone(),
        })?;
        controller.add_stage(Box::new(Fetch::new(
            DirQueue::open(&dir)?,
            client,
            config.fetch.interval.as_duration(),
        )));

        controller.add_stage(Box::new(Build::new(
            DirQueue::open(&dir)?,
            Arc::new(Genisoimage::new(config.build.program.clone())),
            BatchLimits::from(&config.build),
            config.build.interval.as_duration(),
        )));

        let drive = CdrDrive::new(CdrDriveConfig {
            device: config.burn.device.clone(),
            speed: config.burn.speed,
            probe_program: config.burn.probe_program.clone(),
            eject_program: config.burn.eject_program.clone(),
            burn_program: config.burn.burn_program.clone(),
        });
        controller.add_stage(Box::new(Burn::new(
            DirQueue::open(&dir)?,
            Arc::new(drive),
            config.burn.settle.as_duration(),
            config.burn.interval.as_duration(),
        )));

        Ok(controller)
    }

    pub fn working_dir(&self) -> &Path {
        self.queue.dir()
    }

    pub fn log_path(&self) -> PathBuf {
        self.queue.path_of(&self.log_file)
    }

    /// Register a stage to be started by [`Controller::start`]
    pub fn add_stage(&mut self, step: Box<dyn Step>) {
        self.pending.push(step);
    }

    /// Spawn every registered stage on its own task
    pub fn start(&mut self) -> Result<()> {
        match self.phase {
            Phase::Stopped => return Err(ControllerError::Stopped),
            Phase::Running if self.pending.is_empty() => return Ok(()),
            _ => {}
        }

        self.append_log(&LogEntry::now(CONTROLLER_STAGE, "controller starting"))?;
        for step in self.pending.drain(..) {
            let (ctx, link) = worker::channel(step.name());
            info!(stage = link.stage, "Starting worker");
            let handle = tokio::spawn(worker::run_worker(step, ctx));
            self.workers.push(RunningWorker { link, handle });
        }
        self.phase = Phase::Running;
        Ok(())
    }

    /// Queue an event for broadcast on the next pump. Only the latest
    /// event pushed between two pumps is delivered.
    pub fn push_event(&mut self, name: impl Into<String>) {
        self.pending_event = Some(name.into());
    }

    /// Drain every worker's channels, persist its log lines, broadcast the
    /// pending event, then check liveness.
    ///
    /// Returns the latest status string. The first pump after a worker
    /// dies stops every worker and returns [`ControllerError::WorkerDied`];
    /// later calls return [`ControllerError::Stopped`].
    pub fn pump(&mut self) -> Result<String> {
        if self.phase == Phase::Stopped {
            return Err(ControllerError::Stopped);
        }
        self.metrics.pump();

        let mut entries = Vec::new();
        let mut dead = None;
        for worker in &mut self.workers {
            // Checked before draining so a dying worker's last words are kept
            let finished = worker.handle.is_finished();

            if let Some(status) = worker.link.drain_status() {
                self.status = status;
                self.metrics.status_update();
            }
            for line in worker.link.drain_logs() {
                entries.push(LogEntry::now(worker.link.stage, line));
            }
            if finished {
                if let Some(Err(e)) = (&mut worker.handle).now_or_never() {
                    let cause = if e.is_panic() {
                        worker::panic_message(e.into_panic().as_ref())
                    } else {
                        e.to_string()
                    };
                    entries.push(LogEntry::now(
                        CONTROLLER_STAGE,
                        format!("Worker {} ended abnormally - {}", worker.link.stage, cause),
                    ));
                }
                if dead.is_none() {
                    dead = Some(worker.link.stage);
                }
            }
        }
        for entry in &entries {
            self.append_log(entry)?;
        }

        if let Some(name) = self.pending_event.take() {
            let event = ControlEvent::from_name(&name);
            for worker in &self.workers {
                worker.link.send_event(event.clone());
            }
            self.metrics.event_broadcast();
            info!(event = %name, "Broadcast event");
        }

        if let Some(stage) = dead {
            error!(stage, "Worker died, stopping all workers");
            let _ = self.append_log(&LogEntry::now(
                CONTROLLER_STAGE,
                format!("Worker {} died, stopping all workers", stage),
            ));
            self.stop_workers();
            return Err(ControllerError::WorkerDied { stage });
        }

        Ok(self.status.clone())
    }

    /// Stop every worker. In-flight steps are abandoned.
    pub fn shutdown(&mut self) {
        if self.phase == Phase::Running {
            let _ = self.append_log(&LogEntry::now(CONTROLLER_STAGE, "controller stopping"));
        }
        self.stop_workers();
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn stop_workers(&mut self) {
        for worker in self.workers.drain(..) {
            worker.handle.abort();
        }
        self.phase = Phase::Stopped;
    }

    fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.queue.append_line(&self.log_file, &entry.to_string())?;
        self.metrics.log_entry();
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.abort();
        }
    }
}

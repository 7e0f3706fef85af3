//! Worker base contract
//!
//! A worker runs one stage's [`Step`] forever on its own task. It talks to
//! the controller only through three one-way unbounded channels, bundled on
//! the worker side as a [`WorkerContext`] and on the controller side as a
//! [`WorkerLink`]. Workers never share state with each other; they
//! coordinate through the queue directory and controller broadcasts.

pub mod http;

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::feed::FeedError;
use crate::queue::QueueError;
use crate::tools::ToolError;
use self::http::DownloadError;

/// User-originated signal broadcast to every worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// "I have loaded a blank disc"
    DiscLoaded,
    /// Any other named event; stages ignore what they don't understand
    Named(String),
}

impl ControlEvent {
    pub const DISC_LOADED: &'static str = "disc-loaded";

    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            Self::DISC_LOADED => ControlEvent::DiscLoaded,
            other => ControlEvent::Named(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ControlEvent::DiscLoaded => Self::DISC_LOADED,
            ControlEvent::Named(name) => name,
        }
    }
}

/// Fault from one cycle of a stage. Everything but [`StageError::Fatal`]
/// is recoverable.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("feed: {0}")]
    Feed(#[from] FeedError),

    #[error("download: {0}")]
    Download(#[from] DownloadError),

    #[error("tool: {0}")]
    Tool(#[from] ToolError),

    #[error("{0}")]
    Invalid(String),

    /// The stage cannot go on; the worker stops and the controller shuts
    /// the pipeline down
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type StepResult = std::result::Result<(), StageError>;

/// One pipeline stage's loop body
#[async_trait]
pub trait Step: Send {
    /// Stage name used in log lines
    fn name(&self) -> &'static str;

    /// Run one cycle. Errors and panics are logged by [`run_worker`] and the
    /// loop continues, except for [`StageError::Fatal`].
    async fn step(&mut self, ctx: &mut WorkerContext) -> StepResult;

    /// Pause before the next cycle
    fn pause(&self) -> Duration;
}

/// Worker-side channel handles
#[derive(Debug)]
pub struct WorkerContext {
    stage: &'static str,
    log_tx: UnboundedSender<String>,
    status_tx: UnboundedSender<String>,
    event_rx: UnboundedReceiver<ControlEvent>,
}

/// Controller-side channel handles for one worker
#[derive(Debug)]
pub struct WorkerLink {
    pub stage: &'static str,
    pub log_rx: UnboundedReceiver<String>,
    pub status_rx: UnboundedReceiver<String>,
    pub event_tx: UnboundedSender<ControlEvent>,
}

/// Create the three channels between a controller and one worker
pub fn channel(stage: &'static str) -> (WorkerContext, WorkerLink) {
    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    (
        WorkerContext {
            stage,
            log_tx,
            status_tx,
            event_rx,
        },
        WorkerLink {
            stage,
            log_rx,
            status_rx,
            event_tx,
        },
    )
}

impl WorkerContext {
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Drain queued events, returning only the most recent
    pub fn pull_event(&mut self) -> Option<ControlEvent> {
        let mut latest = None;
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => latest = Some(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return latest,
            }
        }
    }

    /// Fire-and-forget log line toward the controller
    pub fn emit_log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(stage = self.stage, "{}", message);
        let _ = self.log_tx.send(message);
    }

    /// Fire-and-forget status line toward the controller
    pub fn emit_status(&self, message: impl Into<String>) {
        let _ = self.status_tx.send(message.into());
    }

    /// True once the controller has dropped its end of the log channel
    pub fn controller_gone(&self) -> bool {
        self.log_tx.is_closed()
    }
}

impl WorkerLink {
    /// Everything logged since the last drain
    pub fn drain_logs(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.log_rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Latest status since the last drain
    pub fn drain_status(&mut self) -> Option<String> {
        let mut latest = None;
        while let Ok(status) = self.status_rx.try_recv() {
            latest = Some(status);
        }
        latest
    }

    pub fn send_event(&self, event: ControlEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }
}

/// Worker entry point: run `step` until the controller goes away.
///
/// Step errors and panics are per-cycle faults: logged, then the loop
/// continues. [`StageError::Fatal`] is logged and ends the task, which the
/// controller treats as worker death.
pub async fn run_worker(mut step: Box<dyn Step>, mut ctx: WorkerContext) {
    info!(stage = step.name(), "Worker starting");
    ctx.emit_log("Worker starting");

    loop {
        let outcome = AssertUnwindSafe(step.step(&mut ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(StageError::Fatal(cause))) => {
                error!(stage = step.name(), cause = %cause, "Worker stopping");
                ctx.emit_log(format!("Worker stopping - {}", cause));
                return;
            }
            Ok(Err(e)) => {
                warn!(stage = step.name(), error = %e, "Cycle failed");
                ctx.emit_log(format!("Cycle failed - {}", e));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(stage = step.name(), panic = %message, "Cycle panicked");
                ctx.emit_log(format!("Cycle panicked - {}", message));
            }
        }

        if ctx.controller_gone() {
            info!(stage = step.name(), "Controller gone, worker exiting");
            return;
        }

        tokio::time::sleep(step.pause()).await;
    }
}

/// Text of a panic payload, when it carries any
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

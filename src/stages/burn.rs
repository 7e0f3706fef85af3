use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::queue::{DirQueue, Stage};
use crate::tools::{DiscDrive, MediaStatus};
use crate::worker::{ControlEvent, Step, StepResult, WorkerContext};

pub const STATUS_CHECKING: &str = "Please wait, checking disc...";
pub const STATUS_OK: &str = "System OK.\n\nNo action required.";
pub const STATUS_ACTION_REQUIRED: &str = "Action required!\n\n\
Step 1: If there is a disc on the tray, put it into a sleeve.\n\n\
Step 2: Place a blank disc onto the tray, label side up, then confirm.";

/// What the burn stage believes is in the drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveState {
    /// Must be verified by probing before anything else happens
    #[default]
    Unknown,
    /// A blank disc is loaded and unused
    Fed,
    /// Waiting for the user to load a blank disc
    NotFed,
}

impl DriveState {
    /// Next state after a probe, and whether the tray should be ejected
    pub fn observe(self, media: MediaStatus) -> (DriveState, bool) {
        match media {
            MediaStatus::Blank => (DriveState::Fed, false),
            MediaStatus::NonBlank => (DriveState::NotFed, true),
            // Tray open or empty: hold it open until the user confirms a disc
            MediaStatus::NoMedium => match self {
                DriveState::Fed => (DriveState::Fed, false),
                _ => (DriveState::NotFed, true),
            },
        }
    }
}

/// Owns the disc drive: probes it, burns pending images, drives the tray
pub struct Burn {
    queue: DirQueue,
    drive: Arc<dyn DiscDrive>,
    state: DriveState,
    settle: Duration,
    interval: Duration,
}

impl Burn {
    pub fn new(queue: DirQueue, drive: Arc<dyn DiscDrive>, settle: Duration, interval: Duration) -> Self {
        Self {
            queue,
            drive,
            state: DriveState::Unknown,
            settle,
            interval,
        }
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    async fn burn_next(&mut self, ctx: &mut WorkerContext) -> StepResult {
        let Some(job) = self.queue.list_pending(Stage::BurnJob)?.into_iter().next() else {
            return Ok(());
        };

        ctx.emit_log(format!("Attempting to burn {}", job));
        let result = self.drive.burn(&self.queue.path_of(&job)).await;

        // Burned or not, the disc has to come out before the drive can be trusted again
        self.state = DriveState::NotFed;
        self.drive.eject().await;

        match result {
            Ok(()) => {
                info!(job = %job, "Burn completed");
                ctx.emit_log(format!("Burn of {} completed successfully, deleting image", job));
                self.queue.consume(&job)?;
            }
            Err(e) => {
                warn!(job = %job, error = %e, "Burn failed");
                ctx.emit_log(format!("Error burning {} - {}", job, e));
            }
        }
        ctx.emit_status(STATUS_ACTION_REQUIRED);
        Ok(())
    }
}

#[async_trait]
impl Step for Burn {
    fn name(&self) -> &'static str {
        "Burn"
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> StepResult {
        if let Some(ControlEvent::DiscLoaded) = ctx.pull_event() {
            // The user's word is only a hint; probe before trusting it
            ctx.emit_log("Disc loaded, re-checking the drive");
            self.state = DriveState::Unknown;
        }

        if self.state == DriveState::Unknown {
            ctx.emit_status(STATUS_CHECKING);
            ctx.emit_log("Drive state unknown, retracting tray before probing");
            self.drive.retract().await;
            tokio::time::sleep(self.settle).await;
        }

        let media = self.drive.probe().await?;
        let previous = self.state;
        let (next, eject) = previous.observe(media);
        self.state = next;

        match media {
            MediaStatus::NonBlank => {
                ctx.emit_log("Non-blank disc inserted, ejecting tray");
            }
            MediaStatus::NoMedium if previous == DriveState::Unknown => {
                ctx.emit_log("No medium found with the tray closed, waiting for a blank disc");
            }
            _ => {}
        }
        if previous != next {
            info!(from = ?previous, to = ?next, ?media, "Drive state changed");
        }
        if eject {
            self.drive.eject().await;
        }

        ctx.emit_status(if self.state == DriveState::Fed {
            STATUS_OK
        } else {
            STATUS_ACTION_REQUIRED
        });

        if self.state == DriveState::Fed && media == MediaStatus::Blank {
            self.burn_next(ctx).await?;
        }
        Ok(())
    }

    fn pause(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolError;
    use crate::worker::channel;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_observe_transitions() {
        use DriveState::*;
        use MediaStatus::*;

        assert_eq!(Unknown.observe(Blank), (Fed, false));
        assert_eq!(NotFed.observe(Blank), (Fed, false));
        assert_eq!(Fed.observe(NonBlank), (NotFed, true));
        assert_eq!(Unknown.observe(NoMedium), (NotFed, true));
        assert_eq!(NotFed.observe(NoMedium), (NotFed, true));
        assert_eq!(Fed.observe(NoMedium), (Fed, false));
    }

    struct ScriptedDrive {
        media: Mutex<MediaStatus>,
        burn_ok: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedDrive {
        fn new(media: MediaStatus, burn_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                media: Mutex::new(media),
                burn_ok,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DiscDrive for ScriptedDrive {
        async fn probe(&self) -> crate::tools::Result<MediaStatus> {
            self.calls.lock().unwrap().push("probe");
            Ok(*self.media.lock().unwrap())
        }

        async fn eject(&self) {
            self.calls.lock().unwrap().push("eject");
        }

        async fn retract(&self) {
            self.calls.lock().unwrap().push("retract");
        }

        async fn burn(&self, _image: &Path) -> crate::tools::Result<()> {
            self.calls.lock().unwrap().push("burn");
            if self.burn_ok {
                Ok(())
            } else {
                Err(ToolError::Failed {
                    program: "wodim".to_string(),
                    code: Some(1),
                    output: "write failed".to_string(),
                })
            }
        }
    }

    fn burn_stage(dir: &TempDir, drive: Arc<ScriptedDrive>) -> Burn {
        Burn::new(
            DirQueue::open(dir.path()).unwrap(),
            drive,
            Duration::ZERO,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_blank_disc_burns_first_job() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DirQueue::open(temp_dir.path()).unwrap();
        let first = queue.publish_bytes(Stage::BurnJob, "", b"iso one").unwrap();
        let second = queue.publish_bytes(Stage::BurnJob, "", b"iso two").unwrap();

        let drive = ScriptedDrive::new(MediaStatus::Blank, true);
        let mut stage = burn_stage(&temp_dir, drive.clone());
        let (mut ctx, mut link) = channel("Burn");

        stage.step(&mut ctx).await.unwrap();

        assert_eq!(drive.calls(), vec!["retract", "probe", "burn", "eject"]);
        assert_eq!(stage.state(), DriveState::NotFed);
        assert_eq!(queue.list_pending(Stage::BurnJob).unwrap(), vec![second]);
        assert!(!queue.path_of(&first).exists());
        assert_eq!(link.drain_status().as_deref(), Some(STATUS_ACTION_REQUIRED));
    }

    #[tokio::test]
    async fn test_failed_burn_keeps_job() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DirQueue::open(temp_dir.path()).unwrap();
        let job = queue.publish_bytes(Stage::BurnJob, "", b"iso").unwrap();

        let drive = ScriptedDrive::new(MediaStatus::Blank, false);
        let mut stage = burn_stage(&temp_dir, drive.clone());
        let (mut ctx, _link) = channel("Burn");

        stage.step(&mut ctx).await.unwrap();

        assert_eq!(stage.state(), DriveState::NotFed);
        assert_eq!(queue.list_pending(Stage::BurnJob).unwrap(), vec![job]);
        assert_eq!(drive.calls().last(), Some(&"eject"));
    }

    #[tokio::test]
    async fn test_non_blank_disc_never_burns() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DirQueue::open(temp_dir.path()).unwrap();
        queue.publish_bytes(Stage::BurnJob, "", b"iso").unwrap();

        let drive = ScriptedDrive::new(MediaStatus::NonBlank, true);
        let mut stage = burn_stage(&temp_dir, drive.clone());
        let (mut ctx, mut link) = channel("Burn");

        stage.step(&mut ctx).await.unwrap();
        stage.step(&mut ctx).await.unwrap();

        assert!(!drive.calls().contains(&"burn"));
        // Only the first cycle retracts; afterwards the state is known
        assert_eq!(
            drive.calls(),
            vec!["retract", "probe", "eject", "probe", "eject"]
        );
        assert_eq!(link.drain_status().as_deref(), Some(STATUS_ACTION_REQUIRED));
    }

    #[tokio::test]
    async fn test_idle_blank_disc_reports_ok() {
        let temp_dir = TempDir::new().unwrap();
        let drive = ScriptedDrive::new(MediaStatus::Blank, true);
        let mut stage = burn_stage(&temp_dir, drive.clone());
        let (mut ctx, mut link) = channel("Burn");

        stage.step(&mut ctx).await.unwrap();

        assert_eq!(stage.state(), DriveState::Fed);
        assert_eq!(link.drain_status().as_deref(), Some(STATUS_OK));
    }
}

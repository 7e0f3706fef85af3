use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{Result, run_tool};

/// What the drive probe saw in the tray
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Blank,
    NonBlank,
    NoMedium,
}

/// Classify `cd-info` output.
///
/// A blank disc has no readable TOC, so cd-info fails with an I/O error.
pub fn classify_probe(output: &str) -> MediaStatus {
    if output.contains("Input/output error") {
        MediaStatus::Blank
    } else if output.contains("No medium found") {
        MediaStatus::NoMedium
    } else {
        MediaStatus::NonBlank
    }
}

/// The physical drive: tray, probe and burner
#[async_trait]
pub trait DiscDrive: Send + Sync {
    async fn probe(&self) -> Result<MediaStatus>;

    /// Fire-and-forget
    async fn eject(&self);

    /// Fire-and-forget
    async fn retract(&self);

    async fn burn(&self, image: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CdrDriveConfig {
    pub device: String,
    pub speed: u32,
    pub probe_program: String,
    pub eject_program: String,
    pub burn_program: String,
}

impl Default for CdrDriveConfig {
    fn default() -> Self {
        Self {
            device: "/dev/cdrw".to_string(),
            speed: 10,
            probe_program: "cd-info".to_string(),
            eject_program: "eject".to_string(),
            burn_program: "wodim".to_string(),
        }
    }
}

/// libcdio `cd-info`, util-linux `eject` and cdrkit `wodim`
#[derive(Debug, Clone, Default)]
pub struct CdrDrive {
    config: CdrDriveConfig,
}

impl CdrDrive {
    pub fn new(config: CdrDriveConfig) -> Self {
        Self { config }
    }

    fn probe_args(&self) -> Vec<String> {
        vec!["--no-device-info".to_string(), self.config.device.clone()]
    }

    fn burn_args(&self, image: &Path) -> Vec<String> {
        vec![
            "-tao".to_string(),
            format!("speed={}", self.config.speed),
            format!("dev={}", self.config.device),
            image.to_string_lossy().into_owned(),
        ]
    }

    async fn tray(&self, args: Vec<String>) {
        match run_tool(&self.config.eject_program, &args, None).await {
            Ok(out) if out.success => {}
            Ok(out) => debug!(code = ?out.code, output = %out.output, "Tray command exited non-zero"),
            Err(e) => warn!(error = %e, "Tray command failed"),
        }
    }
}

#[async_trait]
impl DiscDrive for CdrDrive {
    async fn probe(&self) -> Result<MediaStatus> {
        // cd-info exits non-zero for blank and empty drives; only the text matters
        let out = run_tool(&self.config.probe_program, &self.probe_args(), None).await?;
        let status = classify_probe(&out.output);
        debug!(?status, "Probed drive");
        Ok(status)
    }

    async fn eject(&self) {
        self.tray(vec![self.config.device.clone()]).await;
    }

    async fn retract(&self) {
        self.tray(vec!["-t".to_string(), self.config.device.clone()]).await;
    }

    async fn burn(&self, image: &Path) -> Result<()> {
        info!(image = %image.display(), device = %self.config.device, "Burning image");
        run_tool(&self.config.burn_program, &self.burn_args(image), None)
            .await?
            .check(&self.config.burn_program)?;
        Ok(())
    }
}

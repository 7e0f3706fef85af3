//! External command-line collaborators
//!
//! The pipeline drives image authoring, drive probing, tray control and
//! burning through opaque subprocesses. Each concern sits behind a trait so
//! stages can be exercised without the hardware.

mod drive;
mod image;

pub use drive::{CdrDrive, CdrDriveConfig, DiscDrive, MediaStatus, classify_probe};
pub use image::{Genisoimage, ImageAuthor, ImageEntry, graft_point};

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unable to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} reported an error! Return code {code:?}, output {output}")]
    Failed {
        program: String,
        code: Option<i32>,
        output: String,
    },

    #[error("I/O error talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Exit code and merged stdout/stderr of a finished subprocess
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    /// Turn a non-zero or abnormal exit into [`ToolError::Failed`]
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(ToolError::Failed {
                program: program.to_string(),
                code: self.code,
                output: self.output,
            })
        }
    }
}

/// Run `program args...`, optionally feeding `stdin`, and collect its output
pub async fn run_tool(program: &str, args: &[String], stdin: Option<&str>) -> Result<ToolOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })?;

    // Stdin must be fed while stdout and stderr drain
    let pipe = child.stdin.take();
    let feed = async move {
        match (stdin, pipe) {
            (Some(input), Some(mut pipe)) => {
                let written = pipe.write_all(input.as_bytes()).await;
                // Close stdin so the tool sees end of input
                drop(pipe);
                written
            }
            _ => Ok(()),
        }
    };
    let (written, output) = tokio::join!(feed, child.wait_with_output());

    let output = output.map_err(|source| ToolError::Io {
        program: program.to_string(),
        source,
    })?;
    match written {
        // The tool exited without reading everything; its status tells the story
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
        Err(source) => {
            return Err(ToolError::Io {
                program: program.to_string(),
                source,
            });
        }
        Ok(()) => {}
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ToolOutput {
        code: output.status.code(),
        success: output.status.success(),
        output: text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = run_tool("audrey-no-such-program", &[], None).await;
        assert!(matches!(result, Err(ToolError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_and_exit_status() {
        let out = run_tool("cat", &[], Some("hello\n")).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output, "hello\n");

        let failed = run_tool("sh", &["-c".to_string(), "echo oops >&2; exit 3".to_string()], None)
            .await
            .unwrap();
        assert_eq!(failed.code, Some(3));
        assert!(failed.output.contains("oops"));
        assert!(matches!(
            failed.check("sh"),
            Err(ToolError::Failed { code: Some(3), .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_output_before_reading_stdin() {
        // Fills the stdout pipe before touching stdin, which is also larger
        // than a pipe buffer
        let script = "head -c 262144 /dev/zero; wc -c".to_string();
        let input = "x".repeat(262_144);

        let out = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            run_tool("sh", &["-c".to_string(), script], Some(&input)),
        )
        .await
        .expect("tool should not stall on full pipes")
        .unwrap();

        assert!(out.success);
        assert!(out.output.trim_end().ends_with("262144"));
    }
}

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{Result, run_tool};

/// One file placed into a disc image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// File name inside the image
    pub name: String,
    /// Local file holding the content
    pub source: PathBuf,
}

/// Authors a disc image from local files. All-or-nothing: on `Err` the
/// output path must be treated as garbage.
#[async_trait]
pub trait ImageAuthor: Send + Sync {
    async fn author(&self, output: &Path, entries: &[ImageEntry]) -> Result<()>;
}

/// `name=path` line for `-graft-points`, escaping `\` and `=`
pub fn graft_point(entry: &ImageEntry) -> String {
    fn escape(s: &str) -> String {
        s.replace('\\', "\\\\").replace('=', "\\=")
    }
    format!(
        "{}={}",
        escape(&entry.name),
        escape(&entry.source.to_string_lossy())
    )
}

/// ISO9660 images via `genisoimage`, reading the path list from stdin
#[derive(Debug, Clone)]
pub struct Genisoimage {
    program: String,
}

impl Genisoimage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(output: &Path) -> Vec<String> {
        vec![
            "-l".to_string(),
            "-r".to_string(),
            "-J".to_string(),
            "-graft-points".to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            "-path-list".to_string(),
            "-".to_string(),
        ]
    }
}

impl Default for Genisoimage {
    fn default() -> Self {
        Self::new("genisoimage")
    }
}

#[async_trait]
impl ImageAuthor for Genisoimage {
    async fn author(&self, output: &Path, entries: &[ImageEntry]) -> Result<()> {
        let path_list: String = entries
            .iter()
            .map(|entry| format!("{}\n", graft_point(entry)))
            .collect();

        info!(
            program = %self.program,
            output = %output.display(),
            files = entries.len(),
            "Authoring disc image"
        );
        run_tool(&self.program, &Self::args(output), Some(&path_list))
            .await?
            .check(&self.program)?;
        Ok(())
    }
}

//! Detector and extractor backed by external commands.
//!
//! Both commands receive an image path as their last argument and answer on
//! stdout. A non-zero exit status is a failure of that page or region.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::CommandSpec;
use crate::error::{ExtractionFailure, StageFailure};

use super::types::{BoundingBox, PageArtifact, RegionCrop};
use super::{Detector, Extractor};

/// Run `spec` with `input` appended and return its trimmed stdout.
pub(crate) async fn run_command(spec: &CommandSpec, input: &Path) -> Result<String, String> {
    let output = tokio::process::Command::new(&spec.program)
        .args(&spec.args)
        .arg(input)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("Failed to run {}: {}", spec.program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} exited with {}: {}",
            spec.program,
            output.status,
            stderr.trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Prints a JSON array of `{"x1", "y1", "x2", "y2"}` objects for a page image.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    command: CommandSpec,
}

impl CommandDetector {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, page: &PageArtifact) -> Result<Vec<BoundingBox>, StageFailure> {
        let stdout = run_command(&self.command, &page.path)
            .await
            .map_err(|e| StageFailure::new("detect", e))?;
        if stdout.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&stdout)
            .map_err(|e| StageFailure::new("detect", format!("Invalid detector output: {}", e)))
    }
}

/// Prints the value read from a region crop.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    command: CommandSpec,
    /// Where crops are written for the command to read
    scratch_dir: PathBuf,
    digits_only: bool,
}

impl CommandExtractor {
    pub fn new(command: CommandSpec, scratch_dir: impl Into<PathBuf>, digits_only: bool) -> Self {
        Self {
            command,
            scratch_dir: scratch_dir.into(),
            digits_only,
        }
    }

    fn normalize(&self, raw: &str) -> Option<String> {
        let value: String = if self.digits_only {
            raw.chars().filter(|c| c.is_ascii_digit()).collect()
        } else {
            raw.trim().to_string()
        };
        (!value.is_empty()).then_some(value)
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    async fn extract(&self, crop: &RegionCrop) -> Result<Option<String>, ExtractionFailure> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| ExtractionFailure(e.to_string()))?;
        let path = self
            .scratch_dir
            .join(format!("crop_p{:04}_r{:04}.png", crop.page, crop.region));

        let image = crop.image.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || image.save_with_format(&target, image::ImageFormat::Png))
            .await
            .map_err(|e| ExtractionFailure(e.to_string()))?
            .map_err(|e| ExtractionFailure(format!("Failed to write crop: {}", e)))?;

        let result = run_command(&self.command, &path).await;
        let _ = tokio::fs::remove_file(&path).await;

        let stdout = result.map_err(ExtractionFailure)?;
        Ok(self.normalize(&stdout))
    }
}

//! Page rendering through poppler's `pdftoppm`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::DynamicImage;

use crate::config::CommandSpec;
use crate::error::StageFailure;
use crate::pipeline::Rasterizer;

/// Renders one page per `pdftoppm` invocation; page count comes from lopdf.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    command: CommandSpec,
    scratch_dir: PathBuf,
}

impl PdftoppmRasterizer {
    pub fn new(command: CommandSpec, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            scratch_dir: scratch_dir.into(),
        }
    }

    fn render_args(&self, document: &Path, page: usize, dpi: u32, prefix: &Path) -> Vec<String> {
        let mut args = self.command.args.clone();
        args.extend([
            "-r".to_string(),
            dpi.to_string(),
            "-f".to_string(),
            page.to_string(),
            "-l".to_string(),
            page.to_string(),
            "-singlefile".to_string(),
            "-png".to_string(),
            document.to_string_lossy().into_owned(),
            prefix.to_string_lossy().into_owned(),
        ]);
        args
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    async fn page_count(&self, document: &Path) -> Result<usize, StageFailure> {
        let path = document.to_path_buf();
        tokio::task::spawn_blocking(move || super::inspect::page_count(&path))
            .await
            .map_err(|e| StageFailure::new("rasterize", e.to_string()))?
            .map_err(|e| StageFailure::new("rasterize", e.to_string()))
    }

    async fn render_page(
        &self,
        document: &Path,
        page: usize,
        dpi: u32,
    ) -> Result<DynamicImage, StageFailure> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| StageFailure::new("rasterize", e.to_string()))?;
        let prefix = self.scratch_dir.join(format!("render_p{:04}", page));
        let rendered = prefix.with_extension("png");

        let output = tokio::process::Command::new(&self.command.program)
            .args(self.render_args(document, page, dpi, &prefix))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                StageFailure::new(
                    "rasterize",
                    format!("Failed to run {}: {}", self.command.program, e),
                )
            })?;
        if !output.status.success() {
            return Err(StageFailure::new(
                "rasterize",
                format!(
                    "{} failed on page {}: {}",
                    self.command.program,
                    page,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let path = rendered.clone();
        let image = tokio::task::spawn_blocking(move || image::open(&path))
            .await
            .map_err(|e| StageFailure::new("rasterize", e.to_string()))?
            .map_err(|e| StageFailure::new("rasterize", format!("Unreadable render: {}", e)));
        let _ = tokio::fs::remove_file(&rendered).await;
        image
    }
}

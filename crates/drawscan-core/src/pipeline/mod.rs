//! Resumable page pipeline.
//!
//! ```text
//! document.pdf
//!      │ Rasterizer (page_count, render_page)
//!      ▼
//! pages/page_NNNN.png ──► Detector ──► boxes ──► crop ──► Extractor
//!                                                            │
//!                 checkpoint after every page ◄── Detection ─┘
//! ```
//!
//! The three collaborators are traits so the driver can be exercised with
//! in-memory fakes; the worker process wires in the command-backed adapters.

pub mod command;
mod driver;
pub mod progress;
#[cfg(test)]
pub(crate) mod testing;
mod types;

pub use command::{CommandDetector, CommandExtractor};
pub use driver::{Driver, DriverOutcome};
pub use types::{BoundingBox, Detection, PageArtifact, RegionCrop};

use std::path::Path;

use async_trait::async_trait;
use image::DynamicImage;

use crate::error::{ExtractionFailure, StageFailure};

/// Turns a document into page images.
///
/// Must be deterministic: the same page at the same dpi always renders the
/// same image.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn page_count(&self, document: &Path) -> Result<usize, StageFailure>;

    /// Render the 1-based `page`.
    async fn render_page(
        &self,
        document: &Path,
        page: usize,
        dpi: u32,
    ) -> Result<DynamicImage, StageFailure>;
}

/// Finds regions of interest on a page. An empty result is valid.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, page: &PageArtifact) -> Result<Vec<BoundingBox>, StageFailure>;
}

/// Reads a value out of one region.
///
/// `Ok(None)` means the region held nothing readable and is not an error.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, crop: &RegionCrop) -> Result<Option<String>, ExtractionFailure>;
}

//! In-memory collaborators for driver and supervisor tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{ExtractionFailure, StageFailure};
use crate::jobs::{StatusPublisher, StatusRecord};

use super::types::{BoundingBox, PageArtifact, RegionCrop};
use super::{Detector, Extractor, Rasterizer};

/// Renders blank 200x100 pages.
pub(crate) struct FakeRasterizer {
    pub pages: usize,
    pub renders: Mutex<Vec<usize>>,
    /// Cancels the token after rendering this page
    pub cancel_on: Option<(usize, CancellationToken)>,
}

impl FakeRasterizer {
    pub fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            renders: Mutex::new(Vec::new()),
            cancel_on: None,
        })
    }

    pub fn cancelling_on(pages: usize, page: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            pages,
            renders: Mutex::new(Vec::new()),
            cancel_on: Some((page, token)),
        })
    }

    pub fn renders(&self) -> Vec<usize> {
        self.renders.lock().unwrap().clone()
    }
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn page_count(&self, _document: &Path) -> Result<usize, StageFailure> {
        Ok(self.pages)
    }

    async fn render_page(
        &self,
        _document: &Path,
        page: usize,
        _dpi: u32,
    ) -> Result<DynamicImage, StageFailure> {
        self.renders.lock().unwrap().push(page);
        if let Some((on, token)) = &self.cancel_on {
            if *on == page {
                token.cancel();
            }
        }
        Ok(DynamicImage::new_rgb8(200, 100))
    }
}

/// Returns fixed boxes per page and can misbehave on a chosen page.
#[derive(Default)]
pub(crate) struct ScriptedDetector {
    pub boxes: HashMap<usize, Vec<BoundingBox>>,
    pub calls: Mutex<Vec<usize>>,
    /// Never returns on this page
    pub hang_on: Option<usize>,
    pub fail_on: Option<usize>,
    pub panic_on: Option<usize>,
    pub cancel_on: Option<(usize, CancellationToken)>,
    pub delay: Option<Duration>,
    pub reached: Arc<Notify>,
}

impl ScriptedDetector {
    /// Regions per page: {2, 0, 1}
    pub fn three_pages() -> Self {
        let mut boxes = HashMap::new();
        boxes.insert(
            1,
            vec![BoundingBox::new(0, 0, 20, 20), BoundingBox::new(30, 0, 50, 20)],
        );
        boxes.insert(2, Vec::new());
        boxes.insert(3, vec![BoundingBox::new(10, 10, 40, 40)]);
        Self {
            boxes,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, page: &PageArtifact) -> Result<Vec<BoundingBox>, StageFailure> {
        self.calls.lock().unwrap().push(page.page);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.hang_on == Some(page.page) {
            self.reached.notify_one();
            std::future::pending::<()>().await;
        }
        if self.panic_on == Some(page.page) {
            panic!("detector crashed on page {}", page.page);
        }
        if self.fail_on == Some(page.page) {
            return Err(StageFailure::new("detect", "model crashed"));
        }
        if let Some((on, token)) = &self.cancel_on {
            if *on == page.page {
                token.cancel();
            }
        }
        Ok(self.boxes.get(&page.page).cloned().unwrap_or_default())
    }
}

/// Reads `page*10 + region`; a box starting at x=150 is blank, x=160 fails.
pub(crate) struct NumberExtractor;

#[async_trait]
impl Extractor for NumberExtractor {
    async fn extract(&self, crop: &RegionCrop) -> Result<Option<String>, ExtractionFailure> {
        match crop.bbox.x1 {
            150 => Ok(None),
            160 => Err(ExtractionFailure("unreadable".to_string())),
            _ => Ok(Some((crop.page * 10 + crop.region).to_string())),
        }
    }
}

/// Keeps every published record.
#[derive(Default)]
pub(crate) struct Recorder(Mutex<Vec<StatusRecord>>);

impl Recorder {
    pub fn records(&self) -> Vec<StatusRecord> {
        self.0.lock().unwrap().clone()
    }
}

impl StatusPublisher for Recorder {
    fn publish(&self, record: StatusRecord) {
        self.0.lock().unwrap().push(record);
    }
}

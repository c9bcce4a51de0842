//! Pipeline value types.

use std::path::PathBuf;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned region in page pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Normalize corner order and clip to a `width` x `height` image.
    ///
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clamp(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let clipped = BoundingBox {
            x1: self.x1.min(self.x2).min(width),
            y1: self.y1.min(self.y2).min(height),
            x2: self.x1.max(self.x2).min(width),
            y2: self.y1.max(self.y2).min(height),
        };
        (!clipped.is_empty()).then_some(clipped)
    }
}

/// One value read from one detected region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// 1-based page number
    pub page: usize,
    /// 0-based index in the detector's output for that page
    pub region: usize,
    pub bbox: BoundingBox,
    pub value: String,
    /// Resolution the page was rasterized at
    pub dpi: u32,
    pub image_width: u32,
    pub image_height: u32,
}

/// A rasterized page, as handed to the detector.
#[derive(Debug, Clone)]
pub struct PageArtifact {
    pub page: usize,
    pub path: PathBuf,
    pub image: DynamicImage,
}

/// A region cut out of a page, as handed to the extractor.
#[derive(Debug, Clone)]
pub struct RegionCrop {
    pub page: usize,
    pub region: usize,
    pub bbox: BoundingBox,
    pub image: DynamicImage,
}

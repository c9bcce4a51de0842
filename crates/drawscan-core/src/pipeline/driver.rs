//! Runs the page pipeline for one document, resuming from its checkpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::jobs::{StatusPublisher, StatusRecord};
use crate::storage::{write_atomic, CheckpointState, CheckpointStore, DocumentDir};

use super::progress;
use super::types::{Detection, PageArtifact, RegionCrop};
use super::{Detector, Extractor, Rasterizer};

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    Complete { detections: usize },
    Cancelled,
}

/// Fatal failure that ends the attempt.
#[derive(Debug)]
struct Fatal {
    kind: ErrorKind,
    message: String,
}

impl Fatal {
    fn new(kind: ErrorKind, message: impl std::fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

/// Last state known to be on disk, re-saved when a run stops early.
#[derive(Debug, Default)]
struct Durable {
    completed_pages: usize,
    total_pages: usize,
    results: Vec<Detection>,
}

/// Pipeline driver for one document.
pub struct Driver {
    /// For logging only
    pub job_id: String,
    pub content_hash: String,
    pub document: PathBuf,
    /// Session output directory for this document
    pub output: DocumentDir,
    pub dpi: u32,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub detector: Arc<dyn Detector>,
    pub extractor: Arc<dyn Extractor>,
    pub checkpoints: CheckpointStore,
}

impl Driver {
    /// Run to a terminal status, publishing progress along the way.
    ///
    /// The returned record has also been published.
    pub async fn run(
        &self,
        publisher: &dyn StatusPublisher,
        cancel: &CancellationToken,
    ) -> StatusRecord {
        let mut durable = None;
        let record = match self.execute(publisher, cancel, &mut durable).await {
            Ok(DriverOutcome::Complete { detections }) => {
                tracing::info!(job_id = %self.job_id, detections, "Processing complete");
                StatusRecord::complete(
                    detections,
                    format!("Processing complete! Found {} balloons.", detections),
                )
            }
            Ok(DriverOutcome::Cancelled) => {
                tracing::info!(job_id = %self.job_id, "Processing cancelled");
                self.resave(durable).await;
                StatusRecord::cancelled("Processing cancelled")
            }
            Err(fatal) => {
                tracing::error!(
                    job_id = %self.job_id,
                    kind = %fatal.kind,
                    error = %fatal.message,
                    "Processing failed"
                );
                self.resave(durable).await;
                StatusRecord::error(fatal.kind, fatal.message)
            }
        };
        publisher.publish(record.clone());
        record
    }

    async fn execute(
        &self,
        publisher: &dyn StatusPublisher,
        cancel: &CancellationToken,
        durable: &mut Option<Durable>,
    ) -> Result<DriverOutcome, Fatal> {
        if cancel.is_cancelled() {
            return Ok(DriverOutcome::Cancelled);
        }
        publisher.publish(StatusRecord::running(
            progress::INITIALIZING,
            "Initializing models...",
        ));

        let resume = match self.checkpoints.load(&self.content_hash).await {
            Ok(CheckpointState::Resumable(checkpoint)) => Some(checkpoint),
            Ok(CheckpointState::Completed(_)) => {
                tracing::info!(job_id = %self.job_id, "Found completed checkpoint, starting fresh");
                None
            }
            Ok(CheckpointState::Missing) => None,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to load checkpoint, starting fresh");
                None
            }
        };

        publisher.publish(StatusRecord::running(
            progress::CONVERTING,
            "Converting PDF to images...",
        ));
        let total = self
            .rasterizer
            .page_count(&self.document)
            .await
            .map_err(|e| Fatal::new(ErrorKind::Input, e))?;
        if total == 0 {
            return Err(Fatal::new(ErrorKind::Input, "Document has no pages"));
        }

        let (start, mut results) = match resume {
            Some(checkpoint) if checkpoint.total_pages == total => {
                tracing::info!(
                    job_id = %self.job_id,
                    completed_pages = checkpoint.completed_pages,
                    total_pages = total,
                    "Resuming from checkpoint"
                );
                *durable = Some(Durable {
                    completed_pages: checkpoint.completed_pages,
                    total_pages: total,
                    results: checkpoint.results.clone(),
                });
                (checkpoint.completed_pages, checkpoint.results)
            }
            Some(checkpoint) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    checkpoint_pages = checkpoint.total_pages,
                    total_pages = total,
                    "Checkpoint page count does not match document, starting fresh"
                );
                (0, Vec::new())
            }
            None => (0, Vec::new()),
        };

        if !self.render_missing(total, publisher, cancel).await? {
            return Ok(DriverOutcome::Cancelled);
        }
        publisher.publish(StatusRecord::running(
            progress::CONVERTED,
            format!("Converted {} pages. Starting detection...", total),
        ));

        for index in start..total {
            if cancel.is_cancelled() {
                return Ok(DriverOutcome::Cancelled);
            }
            let page = index + 1;
            let artifact = self.load_page(page).await?;
            let (width, height) = (artifact.image.width(), artifact.image.height());

            publisher.publish(StatusRecord::running(
                progress::page_start(index, total),
                format!("Page {}/{}: Detecting balloons...", page, total),
            ));
            let boxes = match self.detector.detect(&artifact).await {
                Ok(boxes) => boxes,
                Err(e) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        page,
                        kind = %ErrorKind::TransientStage,
                        error = %e,
                        "Detection failed, skipping page"
                    );
                    Vec::new()
                }
            };
            publisher.publish(StatusRecord::running(
                progress::page_start(index, total),
                format!("Page {}/{}: Found {} balloons", page, total, boxes.len()),
            ));

            for (region, bbox) in boxes.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Ok(DriverOutcome::Cancelled);
                }
                publisher.publish(StatusRecord::running(
                    progress::region(index, total, region, boxes.len()),
                    format!(
                        "Page {}/{}: Reading balloon {}/{}",
                        page,
                        total,
                        region + 1,
                        boxes.len()
                    ),
                ));

                let Some(clipped) = bbox.clamp(width, height) else {
                    tracing::debug!(job_id = %self.job_id, page, region, ?bbox, "Empty region, skipping");
                    continue;
                };
                let crop = RegionCrop {
                    page,
                    region,
                    bbox: clipped,
                    image: artifact.image.crop_imm(
                        clipped.x1,
                        clipped.y1,
                        clipped.width(),
                        clipped.height(),
                    ),
                };

                match self.extractor.extract(&crop).await {
                    Ok(Some(value)) => results.push(Detection {
                        page,
                        region,
                        bbox: clipped,
                        value,
                        dpi: self.dpi,
                        image_width: width,
                        image_height: height,
                    }),
                    Ok(None) => {
                        tracing::debug!(job_id = %self.job_id, page, region, "No value in region");
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %self.job_id,
                            page,
                            region,
                            kind = %ErrorKind::TransientStage,
                            error = %e,
                            "Extraction failed, dropping region"
                        );
                    }
                }
            }

            self.checkpoints
                .save(&self.content_hash, page, total, &results)
                .await
                .map_err(|e| Fatal::new(ErrorKind::CheckpointWrite, e))?;
            *durable = Some(Durable {
                completed_pages: page,
                total_pages: total,
                results: results.clone(),
            });
            publisher.publish(StatusRecord::running(
                progress::page_start(page, total),
                format!("Page {}/{}: done", page, total),
            ));
        }

        publisher.publish(StatusRecord::running(progress::SAVING, "Saving results..."));
        self.output
            .write_results(&results)
            .await
            .map_err(|e| Fatal::new(ErrorKind::Stage, format!("{:#}", e)))?;
        self.checkpoints
            .mark_complete(&self.content_hash)
            .await
            .map_err(|e| Fatal::new(ErrorKind::CheckpointWrite, e))?;

        Ok(DriverOutcome::Complete {
            detections: results.len(),
        })
    }

    /// Render every page whose artifact is not on disk yet.
    ///
    /// Returns `false` when cancelled before all pages were rendered.
    async fn render_missing(
        &self,
        total: usize,
        publisher: &dyn StatusPublisher,
        cancel: &CancellationToken,
    ) -> Result<bool, Fatal> {
        let pages_dir = self.output.pages_dir();
        tokio::fs::create_dir_all(&pages_dir)
            .await
            .map_err(|e| Fatal::new(ErrorKind::Stage, format!("{}: {}", pages_dir.display(), e)))?;

        for page in 1..=total {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let path = self.output.page_path(page);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                let image = self
                    .rasterizer
                    .render_page(&self.document, page, self.dpi)
                    .await
                    .map_err(|e| Fatal::new(ErrorKind::Stage, e))?;
                save_png(&path, image).await.map_err(|e| {
                    Fatal::new(
                        ErrorKind::Stage,
                        format!("Failed to write page {}: {:#}", page, e),
                    )
                })?;
                tracing::debug!(job_id = %self.job_id, page, "Rendered page");
            }
            publisher.publish(StatusRecord::running(
                progress::rendering(page, total),
                format!("Converting PDF to images... ({}/{})", page, total),
            ));
        }
        Ok(true)
    }

    async fn load_page(&self, page: usize) -> Result<PageArtifact, Fatal> {
        let path = self.output.page_path(page);
        let image = load_png(&path).await.map_err(|e| {
            Fatal::new(
                ErrorKind::Stage,
                format!("Failed to load page {}: {:#}", page, e),
            )
        })?;
        Ok(PageArtifact { page, path, image })
    }

    /// Write the last durable checkpoint back. Best effort.
    async fn resave(&self, durable: Option<Durable>) {
        let Some(durable) = durable else {
            return;
        };
        if let Err(e) = self
            .checkpoints
            .save(
                &self.content_hash,
                durable.completed_pages,
                durable.total_pages,
                &durable.results,
            )
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to re-save checkpoint");
        }
    }
}

async fn save_png(path: &Path, image: DynamicImage) -> anyhow::Result<()> {
    let bytes = tokio::task::spawn_blocking(move || -> image::ImageResult<Vec<u8>> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageFormat::Png)?;
        Ok(buf.into_inner())
    })
    .await??;
    write_atomic(path, &bytes).await?;
    Ok(())
}

async fn load_png(path: &Path) -> anyhow::Result<DynamicImage> {
    let path = path.to_path_buf();
    let image = tokio::task::spawn_blocking(move || image::open(&path)).await??;
    Ok(image)
}

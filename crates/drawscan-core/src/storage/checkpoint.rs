//! Per-content progress records that let an interrupted job resume.
//!
//! One checkpoint exists per content hash, not per job: a resubmission of
//! the same bytes picks up where the previous attempt stopped.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, IoContext};
use crate::pipeline::Detection;

use super::write_atomic;

/// Durable progress for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub content_hash: String,
    pub total_pages: usize,
    /// Number of pages fully processed; resume re-enters at page `completed_pages + 1`
    pub completed_pages: usize,
    pub results: Vec<Detection>,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Invariants: progress within range, results only from completed pages.
    fn is_consistent(&self) -> bool {
        self.completed_pages <= self.total_pages
            && self
                .results
                .iter()
                .all(|d| d.page >= 1 && d.page <= self.completed_pages)
    }
}

/// Outcome of [`CheckpointStore::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointState {
    /// Nothing saved (or the saved record was unusable)
    Missing,
    /// Partial progress to resume from
    Resumable(Checkpoint),
    /// A previous run finished; never re-entered
    Completed(Checkpoint),
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, content_hash: &str) -> PathBuf {
        self.root.join(content_hash)
    }

    fn record_path(&self, content_hash: &str) -> PathBuf {
        self.dir(content_hash).join("checkpoint.json")
    }

    /// Parallel artifact holding just the accumulated results.
    pub fn partial_results_path(&self, content_hash: &str) -> PathBuf {
        self.dir(content_hash).join("partial_results.json")
    }

    pub async fn load(&self, content_hash: &str) -> Result<CheckpointState, CheckpointError> {
        let path = self.record_path(content_hash);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointState::Missing)
            }
            Err(e) => return Err(e).checkpoint_io(&path),
        };

        let checkpoint: Checkpoint = match serde_json::from_slice(&bytes) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(content_hash, error = %e, "Unreadable checkpoint, starting over");
                return Ok(CheckpointState::Missing);
            }
        };

        if checkpoint.content_hash != content_hash || !checkpoint.is_consistent() {
            tracing::warn!(
                content_hash,
                completed = checkpoint.completed_pages,
                total = checkpoint.total_pages,
                "Inconsistent checkpoint, starting over"
            );
            return Ok(CheckpointState::Missing);
        }

        if checkpoint.completed {
            Ok(CheckpointState::Completed(checkpoint))
        } else {
            Ok(CheckpointState::Resumable(checkpoint))
        }
    }

    /// Persist progress after a completed page.
    ///
    /// The results artifact is written before the record, so the record never
    /// references results that are not on disk.
    pub async fn save(
        &self,
        content_hash: &str,
        completed_pages: usize,
        total_pages: usize,
        results: &[Detection],
    ) -> Result<Checkpoint, CheckpointError> {
        if completed_pages > total_pages {
            return Err(CheckpointError::OutOfRange {
                completed: completed_pages,
                total: total_pages,
            });
        }

        let checkpoint = Checkpoint {
            content_hash: content_hash.to_string(),
            total_pages,
            completed_pages,
            results: results.to_vec(),
            completed: false,
            updated_at: Utc::now(),
        };
        self.write(&checkpoint).await?;

        tracing::debug!(content_hash, completed_pages, total_pages, "Checkpoint saved");
        Ok(checkpoint)
    }

    /// Flip the completion flag. The record stays until [`Self::remove`].
    pub async fn mark_complete(&self, content_hash: &str) -> Result<(), CheckpointError> {
        let mut checkpoint = match self.load(content_hash).await? {
            CheckpointState::Resumable(c) | CheckpointState::Completed(c) => c,
            CheckpointState::Missing => {
                return Err(CheckpointError::Io {
                    path: self.record_path(content_hash),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no checkpoint to mark complete",
                    ),
                })
            }
        };
        checkpoint.completed = true;
        checkpoint.updated_at = Utc::now();
        self.write(&checkpoint).await
    }

    /// Reclaim the checkpoint once its output is safely cached.
    pub async fn remove(&self, content_hash: &str) -> Result<(), CheckpointError> {
        let dir = self.dir(content_hash);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).checkpoint_io(&dir),
        }
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.dir(&checkpoint.content_hash);
        tokio::fs::create_dir_all(&dir).await.checkpoint_io(&dir)?;

        let partial = self.partial_results_path(&checkpoint.content_hash);
        let results_json = serde_json::to_vec(&checkpoint.results)?;
        write_atomic(&partial, &results_json)
            .await
            .checkpoint_io(&partial)?;

        let record = self.record_path(&checkpoint.content_hash);
        let json = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&record, &json).await.checkpoint_io(&record)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

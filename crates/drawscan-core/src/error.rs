//! Error taxonomy for the job pipeline.
//!
//! Stage-local failures (`ExtractionFailure`, `StageFailure`) are absorbed by
//! the driver. Everything else ends the attempt with a terminal status that
//! carries an [`ErrorKind`] and a human-readable message.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Machine-readable category attached to `error` status records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or undecodable document. Never retried.
    Input,
    /// A single region or page failed. Absorbed, only ever logged.
    TransientStage,
    /// The worker process died without writing a terminal status.
    WorkerCrash,
    /// Publishing to the content cache failed. Logged, job stays complete.
    CacheCommit,
    /// Progress could not be persisted.
    CheckpointWrite,
    /// An artifact did not appear within the configured bound.
    ArtifactTimeout,
    /// Any other fatal pipeline failure.
    Stage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Input => write!(f, "input"),
            ErrorKind::TransientStage => write!(f, "transient_stage"),
            ErrorKind::WorkerCrash => write!(f, "worker_crash"),
            ErrorKind::CacheCommit => write!(f, "cache_commit"),
            ErrorKind::CheckpointWrite => write!(f, "checkpoint_write"),
            ErrorKind::ArtifactTimeout => write!(f, "artifact_timeout"),
            ErrorKind::Stage => write!(f, "stage"),
        }
    }
}

/// Rejected document, reported to the caller at submission.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("File too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Empty document")]
    Empty,
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
    #[error("Failed to parse PDF: {0}")]
    Undecodable(String),
    #[error("Document has no pages")]
    NoPages,
}

/// Failure to read a value out of one region. The region is dropped.
#[derive(Debug, thiserror::Error)]
#[error("extraction failed: {0}")]
pub struct ExtractionFailure(pub String);

/// Failure of a stage on one page or one region.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {message}")]
pub struct StageFailure {
    pub stage: &'static str,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Checkpoint persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("completed pages {completed} exceeds total pages {total}")]
    OutOfRange { completed: usize, total: usize },
}

/// Content cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("no cache entry for {0}")]
    Missing(String),
    #[error("source output for {0} is incomplete")]
    IncompleteSource(String),
    #[error("digest mismatch for cache entry {0}")]
    DigestMismatch(String),
}

pub(crate) trait IoContext<T> {
    fn checkpoint_io(self, path: &std::path::Path) -> Result<T, CheckpointError>;
    fn cache_io(self, path: &std::path::Path) -> Result<T, CacheError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn checkpoint_io(self, path: &std::path::Path) -> Result<T, CheckpointError> {
        self.map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn cache_io(self, path: &std::path::Path) -> Result<T, CacheError> {
        self.map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

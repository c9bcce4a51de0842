//! Job types shared by the supervisor, launchers and the worker process.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackendSettings;
use crate::storage::DocumentDir;

use super::status::StatusRecord;

/// Job identifier, a UUID v4 string.
pub type JobId = String;

pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}

/// Returned to the client from a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub content_hash: String,
    pub status: StatusRecord,
    /// Output was copied from the content cache; no worker was started
    pub cache_hit: bool,
}

/// Timing knobs for supervising workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    /// How often liveness and artifacts are polled
    pub poll_interval: Duration,
    /// How long a cancelled worker gets to stop on its own before it is killed
    pub grace_period: Duration,
    /// Upper bound on waiting for `results.json` after a worker reports completion
    pub artifact_wait: Duration,
    /// Upper bound on waiting for a worker's last status lines after it exits
    pub reader_drain: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            grace_period: Duration::from_secs(5),
            artifact_wait: Duration::from_secs(10),
            reader_drain: Duration::from_secs(2),
        }
    }
}

/// Everything a worker needs to run one job.
///
/// Serialized to `<jobs>/<job_id>/worker.json` for worker processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub job_id: JobId,
    pub content_hash: String,
    /// Stored upload inside the session workspace
    pub document: PathBuf,
    /// Session document directory receiving pages and results
    pub output_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    /// Per-job temporary files (renders, crops)
    pub scratch_dir: PathBuf,
    pub dpi: u32,
    pub backends: BackendSettings,
}

impl WorkerSpec {
    pub fn output(&self) -> DocumentDir {
        DocumentDir::new(&self.output_dir)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code; `None` when killed, aborted or panicked
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated"),
        }
    }
}

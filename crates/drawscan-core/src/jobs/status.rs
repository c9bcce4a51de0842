//! Job status records and the most-recent-wins status cell.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ErrorKind;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Error | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Complete => write!(f, "complete"),
            JobState::Error => write!(f, "error"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Latest known status of a job. No history is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: JobState,
    /// 0..=100
    pub progress: f32,
    pub message: String,
    /// Number of detections, set on `complete`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<usize>,
    /// Set on `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    fn new(state: JobState, progress: f32, message: impl Into<String>) -> Self {
        Self {
            state,
            progress,
            message: message.into(),
            detections: None,
            error_kind: None,
            updated_at: Utc::now(),
        }
    }

    pub fn queued(message: impl Into<String>) -> Self {
        Self::new(JobState::Queued, 0.0, message)
    }

    pub fn running(progress: f32, message: impl Into<String>) -> Self {
        Self::new(JobState::Running, progress, message)
    }

    pub fn complete(detections: usize, message: impl Into<String>) -> Self {
        Self {
            detections: Some(detections),
            ..Self::new(JobState::Complete, 100.0, message)
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind: Some(kind),
            ..Self::new(JobState::Error, 0.0, message)
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(JobState::Cancelled, 0.0, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Sink for status updates produced by a running job.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, record: StatusRecord);
}

/// Shared, most-recent-wins status slot.
///
/// Once a terminal record is stored every later update is ignored, and
/// progress never moves backwards.
#[derive(Debug, Clone)]
pub struct StatusCell {
    tx: Arc<watch::Sender<StatusRecord>>,
}

impl StatusCell {
    pub fn new(initial: StatusRecord) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> StatusRecord {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusRecord> {
        self.tx.subscribe()
    }

    /// Store `record` unless the cell already holds a terminal record.
    /// Returns whether the record was accepted.
    pub fn update(&self, mut record: StatusRecord) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            record.progress = if record.state == JobState::Complete {
                100.0
            } else {
                record.progress.clamp(0.0, 100.0).max(current.progress)
            };
            *current = record;
            true
        })
    }
}

impl StatusPublisher for StatusCell {
    fn publish(&self, record: StatusRecord) {
        if !self.update(record) {
            tracing::trace!("Ignoring status update after terminal state");
        }
    }
}

//! The supervisor's job table.

use std::collections::{HashMap, VecDeque};

use crate::storage::DocumentDir;

use super::launcher::WorkerHandle;
use super::status::{StatusCell, StatusRecord};
use super::types::JobId;

pub(crate) enum Phase {
    /// Worker alive as far as we know
    Running(Box<dyn WorkerHandle>),
    /// Exit observed or cancel in progress; one caller owns the bookkeeping
    Finalizing,
}

pub(crate) struct ActiveJob {
    pub session: String,
    pub content_hash: String,
    pub output: DocumentDir,
    pub status: StatusCell,
    pub phase: Phase,
}

pub(crate) struct FinishedJob {
    pub record: StatusRecord,
}

/// How many terminal records are kept; older ones are dropped first and
/// their ids read as unknown.
pub(crate) const FINISHED_RETENTION: usize = 1024;

/// Jobs by id. A job is in at most one of the two maps.
pub(crate) struct JobTable {
    pub active: HashMap<JobId, ActiveJob>,
    finished: HashMap<JobId, FinishedJob>,
    /// Finished ids, oldest first
    finished_order: VecDeque<JobId>,
    retention: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::with_retention(FINISHED_RETENTION)
    }
}

impl JobTable {
    pub fn with_retention(retention: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    pub fn finish(&mut self, job_id: &str, record: StatusRecord) {
        if self.active.remove(job_id).is_some() {
            self.insert_finished(job_id.to_string(), record);
        }
    }

    /// Record a terminal job, evicting the oldest records beyond retention.
    pub fn insert_finished(&mut self, job_id: JobId, record: StatusRecord) {
        if self
            .finished
            .insert(job_id.clone(), FinishedJob { record })
            .is_none()
        {
            self.finished_order.push_back(job_id);
        }
        while self.finished_order.len() > self.retention {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    pub fn finished_record(&self, job_id: &str) -> Option<&StatusRecord> {
        self.finished.get(job_id).map(|job| &job.record)
    }

    pub fn is_finished(&self, job_id: &str) -> bool {
        self.finished.contains_key(job_id)
    }

    /// Running jobs of `session` that have not reached a terminal state.
    pub fn running_in_session(&self, session: &str) -> Vec<JobId> {
        self.active
            .iter()
            .filter(|(_, job)| {
                job.session == session
                    && matches!(job.phase, Phase::Running(_))
                    && !job.status.current().is_terminal()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn running_ids(&self) -> Vec<JobId> {
        self.active
            .iter()
            .filter(|(_, job)| matches!(job.phase, Phase::Running(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

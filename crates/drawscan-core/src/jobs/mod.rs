//! Job supervision.
//!
//! ```text
//! submit ──► validate ──► store input ──► cancel older session jobs
//!                                                 │
//!                              cache probe ◄──────┘
//!                             │            │
//!                           hit           miss
//!                             │            │
//!                  materialize ─► COMPLETE  launch worker ─► RUNNING
//!                                                │
//!   get_status: exit observed ─► finalize once ──┤
//!       COMPLETE: wait results.json, cache commit, drop checkpoint
//!       no terminal status: ERROR worker_crash
//!   cancel: CANCELLED, stop request, grace period, kill
//! ```
//!
//! One `tokio::sync::Mutex` guards the job table. It is never held while
//! waiting out a grace period, draining worker output or copying cache data.

mod launcher;
mod local;
mod registry;
mod status;
mod types;

pub use launcher::{ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use local::TaskLauncher;
pub use status::{JobState, StatusCell, StatusPublisher, StatusRecord};
pub use types::{new_job_id, JobId, SubmitReceipt, SupervisorPolicy, WorkerExit, WorkerSpec};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::{BackendSettings, Config, Settings};
use crate::error::{ErrorKind, InputError};
use crate::storage::{
    wait_for_file, CacheProbe, CheckpointStore, ContentCache, DocumentDir, SessionError,
    SessionStore, Workspace,
};

use registry::{ActiveJob, JobTable, Phase};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Invalid content hash")]
    InvalidContentHash,
}

/// Owns every job of one service instance.
pub struct Supervisor {
    sessions: SessionStore,
    cache: ContentCache,
    checkpoints: CheckpointStore,
    jobs_dir: PathBuf,
    launcher: Arc<dyn WorkerLauncher>,
    policy: SupervisorPolicy,
    dpi: u32,
    max_upload_bytes: usize,
    backends: BackendSettings,
    table: Mutex<JobTable>,
}

impl Supervisor {
    pub fn new(config: &Config, settings: &Settings, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            sessions: SessionStore::new(&config.sessions_dir),
            cache: ContentCache::new(&config.cache_dir),
            checkpoints: CheckpointStore::new(&config.checkpoints_dir),
            jobs_dir: config.jobs_dir.clone(),
            launcher,
            policy: settings.policy(),
            dpi: settings.dpi,
            max_upload_bytes: settings.max_upload_bytes,
            backends: settings.backends.clone(),
            table: Mutex::new(JobTable::default()),
        }
    }

    pub fn policy(&self) -> SupervisorPolicy {
        self.policy
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Accept a document for `session_key` and start (or short-circuit) a job.
    ///
    /// A rejected document still yields a job, already terminal with
    /// `error_kind = input`.
    pub async fn submit(
        &self,
        session_key: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<SubmitReceipt, SupervisorError> {
        let workspace = self.sessions.resolve(session_key).await?;
        let job_id = new_job_id();
        let content_hash = crate::content_hash(bytes);

        let receipt = |status: StatusRecord, cache_hit: bool| SubmitReceipt {
            job_id: job_id.clone(),
            content_hash: content_hash.clone(),
            status,
            cache_hit,
        };

        if let Err(e) = self.validate(file_name, bytes) {
            return Ok(receipt(self.reject(&job_id, session_key, e).await, false));
        }

        let document = match workspace.store_input(&content_hash, file_name, bytes).await {
            Ok(path) => path,
            Err(SessionError::InvalidFileName(name)) => {
                let record = self
                    .reject(&job_id, session_key, InputError::InvalidFileName(name))
                    .await;
                return Ok(receipt(record, false));
            }
            Err(e) => return Err(e.into()),
        };

        let previous = self.table.lock().await.running_in_session(session_key);
        for other in previous {
            if self.cancel(&other).await {
                tracing::info!(job_id = %other, session = session_key, "Cancelled superseded job");
            }
        }

        if let Some(record) = self.try_cache(&job_id, &content_hash, &workspace).await {
            self.table
                .lock()
                .await
                .insert_finished(job_id.clone(), record.clone());
            return Ok(receipt(record, true));
        }

        let status = self
            .start_worker(&job_id, &content_hash, &workspace, document)
            .await;
        Ok(receipt(status, false))
    }

    fn validate(&self, file_name: &str, bytes: &[u8]) -> Result<(), InputError> {
        if bytes.len() > self.max_upload_bytes {
            return Err(InputError::TooLarge {
                size: bytes.len(),
                max: self.max_upload_bytes,
            });
        }
        let is_pdf = Path::new(file_name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            return Err(InputError::InvalidFileName(file_name.to_string()));
        }
        crate::pdf::inspect(bytes)?;
        Ok(())
    }

    async fn reject(&self, job_id: &str, session_key: &str, error: InputError) -> StatusRecord {
        tracing::warn!(job_id, session = session_key, error = %error, "Rejected upload");
        let record = StatusRecord::error(ErrorKind::Input, error.to_string());
        self.table
            .lock()
            .await
            .insert_finished(job_id.to_string(), record.clone());
        record
    }

    /// Serve the job from the content cache if possible.
    async fn try_cache(
        &self,
        job_id: &str,
        content_hash: &str,
        workspace: &Workspace,
    ) -> Option<StatusRecord> {
        let CacheProbe::Present(summary) = self.cache.probe(content_hash).await else {
            return None;
        };
        match self.cache.materialize(content_hash, workspace).await {
            Ok(_) => {
                tracing::info!(
                    job_id,
                    content_hash,
                    detections = summary.detections_count,
                    "Served from cache"
                );
                Some(StatusRecord::complete(
                    summary.detections_count,
                    format!(
                        "Loaded from cache! Found {} balloons.",
                        summary.detections_count
                    ),
                ))
            }
            Err(e) => {
                tracing::warn!(job_id, content_hash, error = %e, "Cache materialize failed, processing instead");
                None
            }
        }
    }

    async fn start_worker(
        &self,
        job_id: &str,
        content_hash: &str,
        workspace: &Workspace,
        document: PathBuf,
    ) -> StatusRecord {
        let output = workspace.document(content_hash);
        let spec = WorkerSpec {
            job_id: job_id.to_string(),
            content_hash: content_hash.to_string(),
            document,
            output_dir: output.path().to_path_buf(),
            checkpoints_dir: self.checkpoints.root().to_path_buf(),
            scratch_dir: self.jobs_dir.join(job_id).join("scratch"),
            dpi: self.dpi,
            backends: self.backends.clone(),
        };
        let status = StatusCell::new(StatusRecord::queued("Queued"));

        let mut table = self.table.lock().await;
        match self.launcher.launch(&spec, status.clone()).await {
            Ok(handle) => {
                table.active.insert(
                    job_id.to_string(),
                    ActiveJob {
                        session: workspace.key().to_string(),
                        content_hash: content_hash.to_string(),
                        output,
                        status: status.clone(),
                        phase: Phase::Running(handle),
                    },
                );
                tracing::info!(job_id, content_hash, session = workspace.key(), "Job started");
                status.current()
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to start worker");
                let record =
                    StatusRecord::error(ErrorKind::Stage, format!("Failed to start worker: {:#}", e));
                table.insert_finished(job_id.to_string(), record.clone());
                record
            }
        }
    }

    /// Current status of a job, or `None` for an unknown id.
    ///
    /// The first query after the worker exits runs the terminal bookkeeping;
    /// later queries return the recorded terminal status. Only the most
    /// recent 1024 terminal records are retained.
    pub async fn get_status(&self, job_id: &str) -> Option<StatusRecord> {
        let (mut handle, exit, status, output, content_hash) = {
            let mut table = self.table.lock().await;
            if let Some(record) = table.finished_record(job_id) {
                return Some(record.clone());
            }
            let job = table.active.get_mut(job_id)?;
            let Some((handle, exit)) = take_if_exited(job) else {
                return Some(job.status.current());
            };
            (
                handle,
                exit,
                job.status.clone(),
                job.output.clone(),
                job.content_hash.clone(),
            )
        };

        handle.drain(self.policy.reader_drain).await;
        let record = self
            .finalize(job_id, exit, &status, &output, &content_hash)
            .await;
        self.table.lock().await.finish(job_id, record.clone());
        Some(record)
    }

    async fn finalize(
        &self,
        job_id: &str,
        exit: WorkerExit,
        status: &StatusCell,
        output: &DocumentDir,
        content_hash: &str,
    ) -> StatusRecord {
        let record = status.current();
        let record = match record.state {
            JobState::Complete => self.commit_output(job_id, content_hash, output, record).await,
            JobState::Error | JobState::Cancelled => record,
            JobState::Queued | JobState::Running => {
                tracing::error!(job_id, %exit, "Worker exited without a terminal status");
                StatusRecord {
                    progress: record.progress,
                    ..StatusRecord::error(
                        ErrorKind::WorkerCrash,
                        format!("Worker exited unexpectedly ({})", exit),
                    )
                }
            }
        };
        self.remove_job_dir(job_id).await;
        tracing::info!(job_id, state = %record.state, "Job finished");
        record
    }

    async fn commit_output(
        &self,
        job_id: &str,
        content_hash: &str,
        output: &DocumentDir,
        record: StatusRecord,
    ) -> StatusRecord {
        let ready = wait_for_file(
            &output.results_path(),
            self.policy.artifact_wait,
            self.policy.poll_interval,
        )
        .await;
        if !ready {
            tracing::error!(job_id, kind = %ErrorKind::ArtifactTimeout, "Results never appeared");
            return StatusRecord::error(
                ErrorKind::ArtifactTimeout,
                "Results were not written in time",
            );
        }

        let detections = record.detections.unwrap_or(0);
        match self.cache.commit(content_hash, output, detections).await {
            Ok(outcome) => {
                tracing::debug!(job_id, ?outcome, "Cache commit done");
                if let Err(e) = self.checkpoints.remove(content_hash).await {
                    tracing::warn!(job_id, error = %e, "Failed to remove checkpoint");
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id,
                    kind = %ErrorKind::CacheCommit,
                    error = %e,
                    "Failed to commit output to cache"
                );
            }
        }
        record
    }

    /// Cancel a running job. Returns `false` if the job is unknown or
    /// already terminal.
    ///
    /// Returns once the worker is gone: either it stopped within the grace
    /// period or it was killed.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let (mut handle, status) = {
            let mut table = self.table.lock().await;
            let Some(job) = table.active.get_mut(job_id) else {
                return false;
            };
            let handle = match std::mem::replace(&mut job.phase, Phase::Finalizing) {
                Phase::Running(handle) => handle,
                Phase::Finalizing => return false,
            };
            if !job.status.update(StatusRecord::cancelled("Cancelled by user")) {
                job.phase = Phase::Running(handle);
                return false;
            }
            (handle, job.status.clone())
        };

        tracing::info!(job_id, "Cancelling job");
        handle.request_stop().await;
        let exit = self.await_exit(job_id, handle.as_mut()).await;
        handle.drain(self.policy.reader_drain).await;
        tracing::debug!(job_id, %exit, "Cancelled worker exited");

        self.remove_job_dir(job_id).await;
        self.table.lock().await.finish(job_id, status.current());
        true
    }

    /// Wait for a stopping worker, killing it once the grace period is over.
    async fn await_exit(&self, job_id: &str, handle: &mut dyn WorkerHandle) -> WorkerExit {
        let deadline = Instant::now() + self.policy.grace_period;
        loop {
            if let Some(exit) = handle.try_exit() {
                return exit;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(job_id, "Worker ignored stop request, killing");
                return handle.kill().await;
            }
            tokio::time::sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }

    /// Poll until the job is finished (bookkeeping included) or `timeout`
    /// elapses. Returns the last observed status.
    pub async fn wait_for_terminal(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Option<StatusRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self.get_status(job_id).await?;
            if self.table.lock().await.is_finished(job_id) {
                return Some(record);
            }
            if Instant::now() >= deadline {
                return Some(record);
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    pub async fn probe_cache(&self, content_hash: &str) -> Result<CacheProbe, SupervisorError> {
        if !crate::is_content_hash(content_hash) {
            return Err(SupervisorError::InvalidContentHash);
        }
        Ok(self.cache.probe(content_hash).await)
    }

    /// Cancel every running job.
    pub async fn shutdown(&self) {
        let running = self.table.lock().await.running_ids();
        for job_id in running {
            self.cancel(&job_id).await;
        }
    }

    async fn remove_job_dir(&self, job_id: &str) {
        let dir = self.jobs_dir.join(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::debug!(job_id, error = %e, "Failed to remove job directory"),
        }
    }
}

/// Move an exited worker out of the job, leaving it `Finalizing`.
fn take_if_exited(job: &mut ActiveJob) -> Option<(Box<dyn WorkerHandle>, WorkerExit)> {
    match std::mem::replace(&mut job.phase, Phase::Finalizing) {
        Phase::Running(mut handle) => match handle.try_exit() {
            Some(exit) => Some((handle, exit)),
            None => {
                job.phase = Phase::Running(handle);
                None
            }
        },
        Phase::Finalizing => None,
    }
}

#[cfg(test)]
mod tests;

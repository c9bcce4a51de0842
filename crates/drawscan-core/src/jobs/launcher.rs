//! Starting and controlling workers.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;

use crate::storage::write_atomic;
use crate::worker::{encode_line, ControlMessage, WorkerMessage};

use super::status::StatusCell;
use super::types::{WorkerExit, WorkerSpec};

/// Starts one worker per job.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `spec`. Status it reports is applied to `status`.
    async fn launch(
        &self,
        spec: &WorkerSpec,
        status: StatusCell,
    ) -> anyhow::Result<Box<dyn WorkerHandle>>;
}

/// Control over a single running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Non-blocking liveness check.
    fn try_exit(&mut self) -> Option<WorkerExit>;

    /// Ask the worker to stop at its next suspension point.
    async fn request_stop(&mut self);

    /// Terminate the worker and reap it.
    async fn kill(&mut self) -> WorkerExit;

    /// Wait up to `timeout` for status sent before exit to be applied.
    async fn drain(&mut self, timeout: Duration);
}

/// Runs each job in a child process: `<program> [args..] worker --spec <file>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    jobs_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            jobs_dir: jobs_dir.into(),
        }
    }

    /// Arguments placed before the `worker` subcommand.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &WorkerSpec,
        status: StatusCell,
    ) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let dir = self.jobs_dir.join(&spec.job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let spec_path = dir.join("worker.json");
        write_atomic(&spec_path, &serde_json::to_vec_pretty(spec)?)
            .await
            .context("Failed to write worker spec")?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("worker")
            .arg("--spec")
            .arg(&spec_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        let stdout = child.stdout.take().context("Worker stdout not captured")?;
        let stdin = child.stdin.take();
        let reader = tokio::spawn(read_status_lines(stdout, status, spec.job_id.clone()));

        tracing::info!(job_id = %spec.job_id, pid = ?child.id(), "Spawned worker process");
        Ok(Box::new(ProcessHandle {
            job_id: spec.job_id.clone(),
            child,
            stdin,
            reader: Some(reader),
        }))
    }
}

/// Apply every status line from a worker to its cell until EOF.
async fn read_status_lines<R: AsyncRead + Unpin>(output: R, status: StatusCell, job_id: String) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Status(record)) => {
                    status.update(record);
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, error = %e, "Ignoring non-protocol worker output");
                }
            },
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read worker output");
                return;
            }
        }
    }
}

struct ProcessHandle {
    job_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn try_exit(&mut self) -> Option<WorkerExit> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(WorkerExit {
                code: status.code(),
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to poll worker");
                None
            }
        }
    }

    async fn request_stop(&mut self) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let line = match encode_line(&ControlMessage::Cancel) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to encode cancel");
                return;
            }
        };
        let sent = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = sent {
            tracing::debug!(job_id = %self.job_id, error = %e, "Worker no longer reading control messages");
        }
        // Closing stdin is a stop request on its own
        self.stdin = None;
    }

    async fn kill(&mut self) -> WorkerExit {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to kill worker");
        }
        let code = match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        };
        tracing::warn!(job_id = %self.job_id, "Worker killed");
        WorkerExit { code }
    }

    async fn drain(&mut self, timeout: Duration) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        if tokio::time::timeout(timeout, &mut reader).await.is_err() {
            tracing::warn!(job_id = %self.job_id, "Worker output not drained in time");
            reader.abort();
        }
    }
}

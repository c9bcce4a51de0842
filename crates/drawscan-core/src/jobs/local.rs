//! In-process workers on the tokio runtime.
//!
//! No process isolation: killing aborts the task at its next await point.
//! Used for tests and for embedding the pipeline with custom collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::Driver;

use super::launcher::{WorkerHandle, WorkerLauncher};
use super::status::StatusCell;
use super::types::{WorkerExit, WorkerSpec};

type DriverFactory = dyn Fn(&WorkerSpec) -> Driver + Send + Sync;

/// Runs each job's [`Driver`] as a tokio task.
#[derive(Clone)]
pub struct TaskLauncher {
    factory: Arc<DriverFactory>,
}

impl TaskLauncher {
    pub fn new(factory: impl Fn(&WorkerSpec) -> Driver + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(
        &self,
        spec: &WorkerSpec,
        status: StatusCell,
    ) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let driver = (self.factory)(spec);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { driver.run(&status, &token).await });
        let abort = task.abort_handle();

        let (exit_tx, exit_rx) = watch::channel(None);
        let job_id = spec.job_id.clone();
        tokio::spawn(async move {
            let code = match task.await {
                Ok(_) => Some(0),
                Err(e) => {
                    if e.is_panic() {
                        tracing::error!(job_id = %job_id, "In-process worker panicked");
                    }
                    None
                }
            };
            let _ = exit_tx.send(Some(WorkerExit { code }));
        });

        tracing::debug!(job_id = %spec.job_id, "Started in-process worker");
        Ok(Box::new(TaskHandle {
            abort,
            cancel,
            exit: exit_rx,
        }))
    }
}

struct TaskHandle {
    abort: AbortHandle,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<WorkerExit>>,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    fn try_exit(&mut self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    async fn request_stop(&mut self) {
        self.cancel.cancel();
    }

    async fn kill(&mut self) -> WorkerExit {
        self.abort.abort();
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(WorkerExit { code: None }),
            Err(_) => WorkerExit { code: None },
        }
    }

    async fn drain(&mut self, _timeout: Duration) {
        // The driver publishes straight into the cell
    }
}

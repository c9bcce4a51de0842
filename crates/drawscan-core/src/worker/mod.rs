//! Entry point of the isolated worker process.
//!
//! The worker runs exactly one job described by a [`WorkerSpec`] file. Status
//! goes to stdout as protocol lines, so anything else (logs) must go to
//! stderr.

pub mod protocol;

pub use protocol::{encode_line, ControlMessage, WorkerMessage};

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::jobs::{StatusPublisher, StatusRecord, WorkerSpec};
use crate::pdf::PdftoppmRasterizer;
use crate::pipeline::{CommandDetector, CommandExtractor, Driver};
use crate::storage::CheckpointStore;

/// Publishes status records as protocol lines on a writer (stdout in the worker).
pub struct LinePublisher<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> LinePublisher<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> StatusPublisher for LinePublisher<W> {
    fn publish(&self, record: StatusRecord) {
        let line = match encode_line(&WorkerMessage::Status(record)) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode status");
                return;
            }
        };
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = out.write_all(line.as_bytes()).and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "Failed to write status line");
        }
    }
}

/// Cancel `cancel` when a cancel line arrives or the control stream closes.
///
/// Blocking; the worker runs it on its own thread so a pending read never
/// keeps the runtime from shutting down.
pub fn watch_control<R: BufRead>(input: R, cancel: CancellationToken) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Control stream failed, cancelling");
                cancel.cancel();
                return;
            }
        };
        match serde_json::from_str::<ControlMessage>(&line) {
            Ok(ControlMessage::Cancel) => {
                tracing::info!("Cancel requested by supervisor");
                cancel.cancel();
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, line = %line, "Ignoring control line");
            }
        }
    }
    tracing::info!("Control stream closed, cancelling");
    cancel.cancel();
}

/// Build the production driver for `spec`.
pub fn build_driver(spec: &WorkerSpec) -> Driver {
    let backends = &spec.backends;
    Driver {
        job_id: spec.job_id.clone(),
        content_hash: spec.content_hash.clone(),
        document: spec.document.clone(),
        output: spec.output(),
        dpi: spec.dpi,
        rasterizer: Arc::new(PdftoppmRasterizer::new(
            backends.rasterizer.clone(),
            spec.scratch_dir.join("renders"),
        )),
        detector: Arc::new(CommandDetector::new(backends.detector.clone())),
        extractor: Arc::new(CommandExtractor::new(
            backends.extractor.clone(),
            spec.scratch_dir.join("crops"),
            backends.digits_only,
        )),
        checkpoints: CheckpointStore::new(&spec.checkpoints_dir),
    }
}

/// Run the job described by the spec file at `spec_path`.
///
/// Reads control lines from stdin and writes status lines to stdout.
pub async fn run(spec_path: &Path) -> anyhow::Result<StatusRecord> {
    let bytes = tokio::fs::read(spec_path)
        .await
        .with_context(|| format!("Failed to read worker spec {}", spec_path.display()))?;
    let spec: WorkerSpec = serde_json::from_slice(&bytes).context("Invalid worker spec")?;

    tracing::info!(job_id = %spec.job_id, content_hash = %spec.content_hash, "Worker started");

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    // Detached: the thread may still be blocked on stdin when the job ends
    std::thread::Builder::new()
        .name("worker-control".to_string())
        .spawn(move || watch_control(std::io::stdin().lock(), token))
        .context("Failed to start control reader")?;

    let publisher = LinePublisher::new(std::io::stdout());
    let record = build_driver(&spec).run(&publisher, &cancel).await;

    tracing::info!(job_id = %spec.job_id, state = %record.state, "Worker finished");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSettings;
    use crate::jobs::JobState;

    #[test]
    fn test_line_publisher_writes_one_line_per_record() {
        let publisher = LinePublisher::new(Vec::new());
        publisher.publish(StatusRecord::running(10.0, "a"));
        publisher.publish(StatusRecord::complete(1, "b"));

        let out = String::from_utf8(publisher.into_inner()).unwrap();
        let states: Vec<JobState> = out
            .lines()
            .map(|line| match serde_json::from_str(line).unwrap() {
                WorkerMessage::Status(record) => record.state,
            })
            .collect();
        assert_eq!(states, vec![JobState::Running, JobState::Complete]);
    }

    #[test]
    fn test_cancel_line_cancels() {
        let cancel = CancellationToken::new();
        let input: &[u8] = b"noise\n{\"type\":\"cancel\"}\n";
        watch_control(input, cancel.clone());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_closed_control_stream_cancels() {
        let cancel = CancellationToken::new();
        let input: &[u8] = b"";
        watch_control(input, cancel.clone());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_rejects_missing_spec() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(run(&temp_dir.path().join("worker.json")).await.is_err());
    }

    #[test]
    fn test_build_driver_wires_spec() {
        let spec = WorkerSpec {
            job_id: "j".to_string(),
            content_hash: "h".to_string(),
            document: "/s/input/a.pdf".into(),
            output_dir: "/s/documents/h".into(),
            checkpoints_dir: "/d/checkpoints".into(),
            scratch_dir: "/d/jobs/j/scratch".into(),
            dpi: 150,
            backends: BackendSettings::default(),
        };
        let driver = build_driver(&spec);
        assert_eq!(driver.dpi, 150);
        assert_eq!(driver.output.path(), Path::new("/s/documents/h"));
        assert_eq!(driver.checkpoints.root(), Path::new("/d/checkpoints"));
    }
}

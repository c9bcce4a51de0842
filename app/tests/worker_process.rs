//! Runs the real `drawscan worker` binary under the process launcher.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use drawscan_core::jobs::{StatusCell, WorkerExit, WorkerHandle, WorkerLauncher, WorkerSpec};
use drawscan_core::{
    BackendSettings, CommandSpec, Config, ErrorKind, JobState, ProcessLauncher, Settings,
    StatusRecord,
};
use drawscan_lib::commands::{get_job_status, submit_job};
use drawscan_lib::AppState;
use lopdf::{dictionary, Document, Object};

const WORKER: &str = env!("CARGO_BIN_EXE_drawscan");

fn spec(root: &Path, document: &Path, backends: BackendSettings) -> WorkerSpec {
    WorkerSpec {
        job_id: "job-1".to_string(),
        content_hash: "a".repeat(64),
        document: document.to_path_buf(),
        output_dir: root.join("out"),
        checkpoints_dir: root.join("checkpoints"),
        scratch_dir: root.join("jobs/job-1/scratch"),
        dpi: 72,
        backends,
    }
}

async fn wait_exit(handle: &mut Box<dyn WorkerHandle>, timeout: Duration) -> Option<WorkerExit> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(exit) = handle.try_exit() {
            return Some(exit);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Minimal PDF with `pages` empty pages
fn blank_pdf(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.4");
    let pages_id = doc.new_object_id();
    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            })
            .into()
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => Object::Integer(pages as i64),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

#[tokio::test]
async fn test_worker_exits_after_terminal_status_with_control_pipe_open() {
    let temp_dir = tempfile::tempdir().unwrap();
    let launcher = ProcessLauncher::new(WORKER, temp_dir.path().join("jobs"));
    let cell = StatusCell::new(StatusRecord::queued("Queued"));
    let missing = temp_dir.path().join("missing.pdf");

    let mut handle = launcher
        .launch(
            &spec(temp_dir.path(), &missing, BackendSettings::default()),
            cell.clone(),
        )
        .await
        .unwrap();

    let exit = wait_exit(&mut handle, Duration::from_secs(10)).await;
    handle.drain(Duration::from_secs(2)).await;

    let exit = exit.expect("worker published its status but did not exit");
    assert!(exit.success(), "worker exited with {}", exit);
    let status = cell.current();
    assert_eq!(status.state, JobState::Error);
    assert_eq!(status.error_kind, Some(ErrorKind::Input));
}

#[tokio::test]
async fn test_supervisor_finalizes_real_worker() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = Config::with_data_dir(temp_dir.path());
    config.ensure_dirs().unwrap();
    let mut settings = Settings {
        poll_interval_ms: 20,
        ..Settings::default()
    };
    settings.backends.rasterizer = CommandSpec::new("drawscan-missing-rasterizer");
    let launcher = Arc::new(ProcessLauncher::new(WORKER, &config.jobs_dir));
    let state = AppState::new(config, settings, launcher);

    let receipt = submit_job(&state, "alice", "drawing.pdf", &blank_pdf(1))
        .await
        .unwrap();
    state
        .supervisor
        .wait_for_terminal(&receipt.job_id, Duration::from_secs(15))
        .await;

    let status = get_job_status(&state, &receipt.job_id).await.unwrap().status;
    assert_eq!(status.state, JobState::Error);
    assert_eq!(status.error_kind, Some(ErrorKind::Stage));
    // Terminal bookkeeping ran: the job's scratch directory is gone
    assert!(!state.config.jobs_dir.join(&receipt.job_id).exists());
}

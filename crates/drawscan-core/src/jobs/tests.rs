use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::pdf::sample_pdf;
use crate::pipeline::testing::{FakeRasterizer, NumberExtractor, ScriptedDetector};
use crate::pipeline::Driver;
use crate::storage::CheckpointState;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    supervisor: Supervisor,
    config: Config,
    launches: Arc<AtomicUsize>,
    /// Document path handed to each launch
    documents: Arc<std::sync::Mutex<Vec<PathBuf>>>,
}

fn fast_settings() -> Settings {
    Settings {
        poll_interval_ms: 10,
        grace_period_ms: 200,
        artifact_wait_ms: 1_000,
        reader_drain_ms: 200,
        ..Settings::default()
    }
}

/// Supervisor with in-process workers; `detector(n)` serves the n-th launch.
fn harness(
    root: &Path,
    settings: Settings,
    detector: impl Fn(usize) -> Arc<ScriptedDetector> + Send + Sync + 'static,
) -> Harness {
    let config = Config::with_data_dir(root);
    config.ensure_dirs().unwrap();
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    let documents = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = documents.clone();
    let launcher = TaskLauncher::new(move |spec| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        seen.lock().unwrap().push(spec.document.clone());
        Driver {
            job_id: spec.job_id.clone(),
            content_hash: spec.content_hash.clone(),
            document: spec.document.clone(),
            output: spec.output(),
            dpi: spec.dpi,
            rasterizer: FakeRasterizer::new(3),
            detector: detector(n),
            extractor: Arc::new(NumberExtractor),
            checkpoints: CheckpointStore::new(&spec.checkpoints_dir),
        }
    });
    Harness {
        supervisor: Supervisor::new(&config, &settings, Arc::new(launcher)),
        config,
        launches,
        documents,
    }
}

fn launches(h: &Harness) -> usize {
    h.launches.load(Ordering::SeqCst)
}

#[tokio::test]
async fn test_cold_run_then_warm_cache_in_other_session() {
    let temp_dir = tempfile::tempdir().unwrap();
    let h = harness(temp_dir.path(), fast_settings(), |_| {
        Arc::new(ScriptedDetector::three_pages())
    });
    let pdf = sample_pdf(3);

    let first = h.supervisor.submit("alice", "drawing.pdf", &pdf).await.unwrap();
    assert!(!first.cache_hit);
    assert!(!first.status.is_terminal());

    let done = h
        .supervisor
        .wait_for_terminal(&first.job_id, WAIT)
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Complete);
    assert_eq!(done.detections, Some(3));
    assert_eq!(done.message, "Processing complete! Found 3 balloons.");
    assert!(h
        .supervisor
        .probe_cache(&first.content_hash)
        .await
        .unwrap()
        .is_hit());
    // Checkpoint reclaimed after the commit
    assert!(!h.config.checkpoints_dir.join(&first.content_hash).exists());

    let second = h.supervisor.submit("bob", "copy.pdf", &pdf).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.content_hash, first.content_hash);
    assert_eq!(second.status.state, JobState::Complete);
    assert_eq!(second.status.detections, Some(3));
    assert_eq!(launches(&h), 1);

    let bob = h.supervisor.sessions().resolve("bob").await.unwrap();
    let results = bob.document(&second.content_hash).read_results().await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(
        h.supervisor.get_status(&second.job_id).await,
        Some(second.status)
    );
}

#[tokio::test]
async fn test_malformed_input_is_terminal_input_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    let h = harness(temp_dir.path(), fast_settings(), |_| {
        Arc::new(ScriptedDetector::three_pages())
    });

    let receipt = h
        .supervisor
        .submit("alice", "broken.pdf", b"%PDF-1.4 truncated garbage")
        .await
        .unwrap();

    assert_eq!(receipt.status.state, JobState::Error);
    assert_eq!(receipt.status.error_kind, Some(ErrorKind::Input));
    assert!(!receipt.cache_hit);
    assert_eq!(launches(&h), 0);
    assert_eq!(
        std::fs::read_dir(&h.config.checkpoints_dir).unwrap().count(),
        0
    );
    assert_eq!(
        h.supervisor.probe_cache(&receipt.content_hash).await.unwrap(),
        CacheProbe::Absent
    );
    assert_eq!(
        h.supervisor.get_status(&receipt.job_id).await,
        Some(receipt.status)
    );
}

#[tokio::test]
async fn test_upload_validation() {
    let temp_dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        max_upload_bytes: 64,
        ..fast_settings()
    };
    let h = harness(temp_dir.path(), settings, |_| {
        Arc::new(ScriptedDetector::three_pages())
    });

    let too_big = h
        .supervisor
        .submit("alice", "drawing.pdf", &sample_pdf(1))
        .await
        .unwrap();
    assert_eq!(too_big.status.error_kind, Some(ErrorKind::Input));
    assert!(too_big.status.message.contains("too large"));

    for name in ["drawing.png", "../escape.pdf"] {
        let receipt = h.supervisor.submit("alice", name, b"tiny").await.unwrap();
        assert_eq!(receipt.status.error_kind, Some(ErrorKind::Input), "{}", name);
    }
    assert_eq!(launches(&h), 0);

    assert!(matches!(
        h.supervisor.submit("../alice", "drawing.pdf", b"x").await,
        Err(SupervisorError::Session(SessionError::InvalidKey))
    ));
}

#[tokio::test]
async fn test_worker_crash_then_resume() {
    let temp_dir = tempfile::tempdir().unwrap();
    let crashing = Arc::new(ScriptedDetector {
        panic_on: Some(2),
        ..ScriptedDetector::three_pages()
    });
    let healthy = Arc::new(ScriptedDetector::three_pages());
    let detectors = [crashing.clone(), healthy.clone()];
    let h = harness(temp_dir.path(), fast_settings(), move |n| {
        detectors[n.min(1)].clone()
    });
    let pdf = sample_pdf(3);

    let first = h.supervisor.submit("alice", "drawing.pdf", &pdf).await.unwrap();
    let crashed = h
        .supervisor
        .wait_for_terminal(&first.job_id, WAIT)
        .await
        .unwrap();
    assert_eq!(crashed.state, JobState::Error);
    assert_eq!(crashed.error_kind, Some(ErrorKind::WorkerCrash));
    assert_eq!(
        h.supervisor.probe_cache(&first.content_hash).await.unwrap(),
        CacheProbe::Absent
    );

    let checkpoints = CheckpointStore::new(&h.config.checkpoints_dir);
    let CheckpointState::Resumable(checkpoint) =
        checkpoints.load(&first.content_hash).await.unwrap()
    else {
        panic!("expected a resumable checkpoint");
    };
    assert_eq!(checkpoint.completed_pages, 1);

    let second = h.supervisor.submit("alice", "drawing.pdf", &pdf).await.unwrap();
    let done = h
        .supervisor
        .wait_for_terminal(&second.job_id, WAIT)
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Complete);
    assert_eq!(done.detections, Some(3));
    assert_eq!(crashing.calls(), vec![1, 2]);
    assert_eq!(healthy.calls(), vec![2, 3]);
}

#[tokio::test]
async fn test_cancel_is_bounded_when_worker_ignores_it() {
    let temp_dir = tempfile::tempdir().unwrap();
    let stuck = Arc::new(ScriptedDetector {
        hang_on: Some(1),
        ..ScriptedDetector::three_pages()
    });
    let reached = stuck.reached.clone();
    let h = harness(temp_dir.path(), fast_settings(), move |_| stuck.clone());

    let receipt = h
        .supervisor
        .submit("alice", "drawing.pdf", &sample_pdf(3))
        .await
        .unwrap();
    reached.notified().await;

    let start = Instant::now();
    assert!(h.supervisor.cancel(&receipt.job_id).await);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2), "cancel took {:?}", elapsed);

    let status = h.supervisor.get_status(&receipt.job_id).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert!(!h.supervisor.cancel(&receipt.job_id).await);
}

#[tokio::test]
async fn test_cooperative_cancel_keeps_checkpoint() {
    let temp_dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        grace_period_ms: 5_000,
        ..fast_settings()
    };
    let slow = Arc::new(ScriptedDetector {
        delay: Some(Duration::from_millis(100)),
        ..ScriptedDetector::three_pages()
    });
    let h = harness(temp_dir.path(), settings, move |_| slow.clone());
    let pdf = sample_pdf(3);

    let receipt = h.supervisor.submit("alice", "drawing.pdf", &pdf).await.unwrap();
    let checkpoint_file = h
        .config
        .checkpoints_dir
        .join(&receipt.content_hash)
        .join("checkpoint.json");
    assert!(wait_for_file(&checkpoint_file, WAIT, Duration::from_millis(5)).await);

    let start = Instant::now();
    assert!(h.supervisor.cancel(&receipt.job_id).await);
    assert!(start.elapsed() < Duration::from_secs(2));

    let status = h.supervisor.get_status(&receipt.job_id).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);

    let checkpoints = CheckpointStore::new(&h.config.checkpoints_dir);
    match checkpoints.load(&receipt.content_hash).await.unwrap() {
        CheckpointState::Resumable(c) => assert!(c.completed_pages >= 1 && c.completed_pages < 3),
        other => panic!("expected a resumable checkpoint, got {:?}", other),
    }
    assert_eq!(
        h.supervisor.probe_cache(&receipt.content_hash).await.unwrap(),
        CacheProbe::Absent
    );
}

#[tokio::test]
async fn test_new_submission_supersedes_running_job() {
    let temp_dir = tempfile::tempdir().unwrap();
    let stuck = Arc::new(ScriptedDetector {
        hang_on: Some(1),
        ..ScriptedDetector::three_pages()
    });
    let reached = stuck.reached.clone();
    let h = harness(temp_dir.path(), fast_settings(), move |n| {
        if n == 0 {
            stuck.clone()
        } else {
            Arc::new(ScriptedDetector::three_pages())
        }
    });

    let first = h
        .supervisor
        .submit("alice", "a.pdf", &sample_pdf(3))
        .await
        .unwrap();
    reached.notified().await;

    let second = h
        .supervisor
        .submit("alice", "b.pdf", &sample_pdf(2))
        .await
        .unwrap();
    assert_eq!(
        h.supervisor.get_status(&first.job_id).await.unwrap().state,
        JobState::Cancelled
    );

    let done = h
        .supervisor
        .wait_for_terminal(&second.job_id, WAIT)
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Complete);
}

#[tokio::test]
async fn test_same_name_reupload_does_not_touch_running_input() {
    let temp_dir = tempfile::tempdir().unwrap();
    let stuck = Arc::new(ScriptedDetector {
        hang_on: Some(1),
        ..ScriptedDetector::three_pages()
    });
    let reached = stuck.reached.clone();
    let h = harness(temp_dir.path(), fast_settings(), move |n| {
        if n == 0 {
            stuck.clone()
        } else {
            Arc::new(ScriptedDetector::three_pages())
        }
    });
    let (original, fixed) = (sample_pdf(3), sample_pdf(2));

    let first = h
        .supervisor
        .submit("alice", "drawing.pdf", &original)
        .await
        .unwrap();
    reached.notified().await;
    let second = h
        .supervisor
        .submit("alice", "drawing.pdf", &fixed)
        .await
        .unwrap();
    h.supervisor
        .wait_for_terminal(&second.job_id, WAIT)
        .await
        .unwrap();

    let documents = h.documents.lock().unwrap().clone();
    assert_eq!(documents.len(), 2);
    assert_ne!(documents[0], documents[1]);
    assert_eq!(std::fs::read(&documents[0]).unwrap(), original);
    assert_eq!(std::fs::read(&documents[1]).unwrap(), fixed);
    assert_ne!(first.content_hash, second.content_hash);
}

#[tokio::test]
async fn test_jobs_in_other_sessions_are_not_superseded() {
    let temp_dir = tempfile::tempdir().unwrap();
    let slow = Arc::new(ScriptedDetector {
        delay: Some(Duration::from_millis(50)),
        ..ScriptedDetector::three_pages()
    });
    let h = harness(temp_dir.path(), fast_settings(), move |_| slow.clone());

    let a = h
        .supervisor
        .submit("alice", "a.pdf", &sample_pdf(3))
        .await
        .unwrap();
    let b = h
        .supervisor
        .submit("bob", "b.pdf", &sample_pdf(2))
        .await
        .unwrap();

    for job in [&a, &b] {
        let done = h
            .supervisor
            .wait_for_terminal(&job.job_id, WAIT)
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Complete);
    }
}

#[tokio::test]
async fn test_terminal_bookkeeping_runs_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    let h = harness(temp_dir.path(), fast_settings(), |_| {
        Arc::new(ScriptedDetector::three_pages())
    });

    let receipt = h
        .supervisor
        .submit("alice", "drawing.pdf", &sample_pdf(3))
        .await
        .unwrap();
    let workspace = h.supervisor.sessions().resolve("alice").await.unwrap();
    let results = workspace.document(&receipt.content_hash).results_path();
    assert!(wait_for_file(&results, WAIT, Duration::from_millis(5)).await);

    let (a, b) = tokio::join!(
        h.supervisor.wait_for_terminal(&receipt.job_id, WAIT),
        h.supervisor.wait_for_terminal(&receipt.job_id, WAIT),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.state, JobState::Complete);
    assert_eq!(a, b);

    for _ in 0..3 {
        assert_eq!(h.supervisor.get_status(&receipt.job_id).await, Some(a.clone()));
    }
    assert!(!h.supervisor.cancel(&receipt.job_id).await);
}

#[tokio::test]
async fn test_unknown_job() {
    let temp_dir = tempfile::tempdir().unwrap();
    let h = harness(temp_dir.path(), fast_settings(), |_| {
        Arc::new(ScriptedDetector::three_pages())
    });

    assert!(h.supervisor.get_status("missing").await.is_none());
    assert!(!h.supervisor.cancel("missing").await);
    assert!(h
        .supervisor
        .wait_for_terminal("missing", Duration::from_millis(50))
        .await
        .is_none());
    assert!(matches!(
        h.supervisor.probe_cache("../../etc").await,
        Err(SupervisorError::InvalidContentHash)
    ));
}

#[cfg(unix)]
mod process {
    use super::*;

    fn process_supervisor(root: &Path, settings: Settings, script: &str) -> (Supervisor, Config) {
        let config = Config::with_data_dir(root);
        config.ensure_dirs().unwrap();
        let launcher = ProcessLauncher::new("sh", &config.jobs_dir).with_args(["-c", script]);
        (
            Supervisor::new(&config, &settings, Arc::new(launcher)),
            config,
        )
    }

    #[tokio::test]
    async fn test_process_exit_without_status_is_crash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (supervisor, config) = process_supervisor(temp_dir.path(), fast_settings(), "exit 3");

        let receipt = supervisor
            .submit("alice", "drawing.pdf", &sample_pdf(1))
            .await
            .unwrap();
        let status = supervisor
            .wait_for_terminal(&receipt.job_id, WAIT)
            .await
            .unwrap();

        assert_eq!(status.error_kind, Some(ErrorKind::WorkerCrash));
        assert!(status.message.contains("exit code 3"));
        // Job scratch directory is cleaned up
        assert!(!config.jobs_dir.join(&receipt.job_id).exists());
    }

    #[tokio::test]
    async fn test_process_cancel_kills_after_grace() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (supervisor, _config) =
            process_supervisor(temp_dir.path(), fast_settings(), "exec sleep 30");

        let receipt = supervisor
            .submit("alice", "drawing.pdf", &sample_pdf(1))
            .await
            .unwrap();

        let start = Instant::now();
        assert!(supervisor.cancel(&receipt.job_id).await);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(
            supervisor.get_status(&receipt.job_id).await.unwrap().state,
            JobState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_complete_without_results_times_out() {
        let temp_dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            artifact_wait_ms: 100,
            ..fast_settings()
        };
        let script = r#"echo '{"type":"status","state":"complete","progress":100.0,"message":"done","detections":0,"updated_at":"2024-01-01T00:00:00Z"}'"#;
        let (supervisor, _config) = process_supervisor(temp_dir.path(), settings, script);

        let receipt = supervisor
            .submit("alice", "drawing.pdf", &sample_pdf(1))
            .await
            .unwrap();
        let status = supervisor
            .wait_for_terminal(&receipt.job_id, WAIT)
            .await
            .unwrap();

        assert_eq!(status.error_kind, Some(ErrorKind::ArtifactTimeout));
        assert_eq!(
            supervisor.probe_cache(&receipt.content_hash).await.unwrap(),
            CacheProbe::Absent
        );
    }
}

// crates/aquamark-media/tests/engine.rs
//
// Queue, worker-pool and progress-bus scenarios, driven through a synthetic
// runner so no video fixtures or ffmpeg runtime are involved. The runner
// stages a fake output file exactly like the real pipeline would, which also
// exercises the engine's staging/finalize/cleanup discipline.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use uuid::Uuid;

use aquamark_core::bits::{Confidence, DecodedPayload};
use aquamark_core::job::{JobRequest, JobSnapshot, JobStatus};
use aquamark_core::options::{EmbedOptions, EngineConfig, ExtractOptions};
use aquamark_core::WatermarkError;
use aquamark_media::probe::ValidationReport;
use aquamark_media::runner::{JobRunner, RunInput, RunOutput};
use aquamark_media::WatermarkEngine;

// ── Synthetic runner ──────────────────────────────────────────────────────────

/// Runner that "processes" jobs without ffmpeg. Paths containing "bad" fail
/// validation; everything else validates. Runs are optionally gated on a
/// channel so tests control exactly when a worker finishes.
struct SyntheticRunner {
    started: Mutex<Vec<Uuid>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    gate: Option<Receiver<()>>,
}

impl SyntheticRunner {
    fn new() -> Self {
        SyntheticRunner {
            started: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Gated variant: each run blocks until one `()` arrives, polling the
    /// job's stop flag like the real pipeline does at frame boundaries.
    fn gated() -> (Self, Sender<()>) {
        let (tx, rx) = unbounded();
        let mut runner = Self::new();
        runner.gate = Some(rx);
        (runner, tx)
    }

    fn started_order(&self) -> Vec<Uuid> {
        self.started.lock().unwrap().clone()
    }
}

impl JobRunner for SyntheticRunner {
    fn validate(&self, path: &Path, _max_file_size: u64) -> ValidationReport {
        let mut report = ValidationReport::default();
        if path.to_string_lossy().contains("bad") {
            report.errors.push("file does not exist".into());
            return report;
        }
        report.exists = true;
        report.readable = true;
        report.has_video_stream = true;
        report.frame_count = Some(300);
        report.fps = Some(30.0);
        report.width = Some(640);
        report.height = Some(360);
        report
    }

    fn run(&self, input: RunInput<'_>) -> Result<RunOutput, WatermarkError> {
        self.started.lock().unwrap().push(input.job_id);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        input.sink.progress(25.0, "frame 10");
        input.sink.progress(75.0, "frame 30");

        let result = (|| {
            if let Some(gate) = &self.gate {
                // Wait for the release, observing the stop flag the way the
                // per-frame loop does.
                loop {
                    if input.stop.load(Ordering::Relaxed) {
                        return Err(WatermarkError::Shutdown);
                    }
                    match gate.recv_timeout(Duration::from_millis(10)) {
                        Ok(()) => break,
                        Err(_) => continue,
                    }
                }
            } else {
                std::thread::sleep(Duration::from_millis(15));
                if input.stop.load(Ordering::Relaxed) {
                    return Err(WatermarkError::Shutdown);
                }
            }

            match input.request {
                JobRequest::Embed { .. } => {
                    // Stage an output exactly where the real pipeline would.
                    std::fs::write(input.staging, b"synthetic video payload")
                        .map_err(|e| WatermarkError::Internal(e.to_string()))?;
                    input.sink.progress(100.0, "10 frames watermarked");
                    Ok(RunOutput::Embedded { frames: 10 })
                }
                JobRequest::Extract { .. } => Ok(RunOutput::Extracted(DecodedPayload {
                    text: "Hi".into(),
                    confidence: Confidence::High,
                    agreement: 0.97,
                })),
            }
        })();

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Fixture {
    engine: WatermarkEngine,
    runner: Arc<SyntheticRunner>,
    _dirs: tempfile::TempDir,
    work_dir: PathBuf,
    output_dir: PathBuf,
}

fn fixture(workers: usize, queue_cap: usize, runner: SyntheticRunner) -> Fixture {
    let dirs = tempfile::tempdir().unwrap();
    let work_dir = dirs.path().join("work");
    let output_dir = dirs.path().join("out");
    let cfg = EngineConfig {
        queue_cap,
        workers,
        ..EngineConfig::new(work_dir.clone(), output_dir.clone())
    };
    let runner = Arc::new(runner);
    let engine = WatermarkEngine::with_runner(cfg, Arc::clone(&runner) as Arc<dyn JobRunner>)
        .expect("engine construction");
    Fixture { engine, runner, _dirs: dirs, work_dir, output_dir }
}

fn wait_terminal(engine: &WatermarkEngine, id: Uuid) -> JobSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snap = engine.get_job(id).expect("job in table");
        if snap.status.is_terminal() {
            return snap;
        }
        assert!(Instant::now() < deadline, "job {id} never reached a terminal state");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn embed_opts() -> EmbedOptions {
    EmbedOptions::default()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn embed_job_completes_and_finalizes_output() {
    let fx = fixture(2, 100, SyntheticRunner::new());
    let id = fx.engine.submit_embed(Path::new("/videos/clip.mp4"), "Hi", embed_opts()).unwrap();

    let snap = wait_terminal(&fx.engine, id);
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.progress, 100.0);

    let artifact = snap.result.expect("embed result");
    assert_eq!(artifact.output_path, fx.output_dir.join(format!("{id}.mp4")));
    assert!(artifact.output_path.exists());
    assert!(artifact.size > 0);

    // Staging file was renamed away, not left behind.
    assert!(!fx.work_dir.join(format!("{id}.part.mp4")).exists());

    // Registry contract: exactly one completed-artifact record.
    let record = fx
        .engine
        .completed_artifacts()
        .recv_timeout(Duration::from_secs(1))
        .expect("artifact record");
    assert_eq!(record.job_id, id);
    assert_eq!(record.original_name, "clip.mp4");
}

#[test]
fn extract_job_reports_recovered_payload() {
    let fx = fixture(1, 100, SyntheticRunner::new());
    let id = fx
        .engine
        .submit_extract(Path::new("/videos/clip.mp4"), ExtractOptions::default())
        .unwrap();

    let snap = wait_terminal(&fx.engine, id);
    assert_eq!(snap.status, JobStatus::Completed);
    let recovered = snap.recovered.expect("extract result");
    assert_eq!(recovered.text, "Hi");
    assert_eq!(recovered.confidence, Confidence::High);
}

#[test]
fn dequeue_order_is_fifo() {
    // One worker: execution order must equal submission order.
    let fx = fixture(1, 100, SyntheticRunner::new());
    let submitted: Vec<Uuid> = (0..5)
        .map(|i| {
            fx.engine
                .submit_embed(Path::new(&format!("/videos/{i}.mp4")), "Hi", embed_opts())
                .unwrap()
        })
        .collect();

    for &id in &submitted {
        wait_terminal(&fx.engine, id);
    }
    assert_eq!(fx.runner.started_order(), submitted);
}

#[test]
fn worker_pool_bounds_concurrency() {
    // Scenario: 10 jobs, 2 workers — at any instant at most 2 in flight, and
    // every job completes.
    let fx = fixture(2, 100, SyntheticRunner::new());
    let ids: Vec<Uuid> = (0..10)
        .map(|i| {
            fx.engine
                .submit_embed(Path::new(&format!("/videos/{i}.mp4")), "Hi", embed_opts())
                .unwrap()
        })
        .collect();

    for &id in &ids {
        assert_eq!(wait_terminal(&fx.engine, id).status, JobStatus::Completed);
    }
    assert!(fx.runner.max_running.load(Ordering::SeqCst) <= 2);
}

#[test]
fn full_queue_rejects_and_leaves_table_unchanged() {
    let (runner, release) = SyntheticRunner::gated();
    let fx = fixture(1, 2, runner);

    // First job occupies the worker; the next two fill the queue.
    let a = fx.engine.submit_embed(Path::new("/videos/a.mp4"), "Hi", embed_opts()).unwrap();
    // The worker may need an instant to pick up `a` and free its slot.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if fx.engine.get_job(a).unwrap().status == JobStatus::Processing {
            break;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
    let b = fx.engine.submit_embed(Path::new("/videos/b.mp4"), "Hi", embed_opts()).unwrap();
    let c = fx.engine.submit_embed(Path::new("/videos/c.mp4"), "Hi", embed_opts()).unwrap();

    let err = fx.engine.submit_embed(Path::new("/videos/d.mp4"), "Hi", embed_opts()).unwrap_err();
    assert_eq!(err, WatermarkError::QueueFull);

    // The rejected job left no trace.
    assert!(fx.engine.get_job(a).is_some());
    assert!(fx.engine.get_job(b).is_some());
    assert!(fx.engine.get_job(c).is_some());

    for _ in 0..3 {
        release.send(()).unwrap();
    }
    for id in [a, b, c] {
        assert_eq!(wait_terminal(&fx.engine, id).status, JobStatus::Completed);
    }
}

#[test]
fn invalid_input_is_rejected_before_enqueue() {
    let fx = fixture(1, 100, SyntheticRunner::new());
    let err = fx.engine.submit_embed(Path::new("/videos/bad.mp4"), "Hi", embed_opts()).unwrap_err();
    assert!(matches!(err, WatermarkError::InvalidInput(_)));
    // Nothing was queued, nothing ran.
    assert!(fx.runner.started_order().is_empty());
}

#[test]
fn oversized_payload_is_rejected_at_submit() {
    let fx = fixture(1, 100, SyntheticRunner::new());
    let long = "x".repeat(64);
    let err = fx.engine.submit_embed(Path::new("/videos/a.mp4"), &long, embed_opts()).unwrap_err();
    assert!(matches!(err, WatermarkError::InvalidInput(_)));
}

#[test]
fn queued_job_can_be_cancelled_but_running_cannot() {
    let (runner, release) = SyntheticRunner::gated();
    let fx = fixture(1, 100, runner);

    let a = fx.engine.submit_embed(Path::new("/videos/a.mp4"), "Hi", embed_opts()).unwrap();
    // Wait until `a` is actually running so `b` stays queued.
    let deadline = Instant::now() + Duration::from_secs(2);
    while fx.engine.get_job(a).unwrap().status != JobStatus::Processing {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
    let b = fx.engine.submit_embed(Path::new("/videos/b.mp4"), "Hi", embed_opts()).unwrap();

    // Queued → cancellable.
    fx.engine.cancel(b).unwrap();
    let snap = fx.engine.get_job(b).unwrap();
    assert_eq!(snap.status, JobStatus::Error);
    assert_eq!(snap.error.as_deref(), Some("cancelled"));

    // Processing → not cancellable; unknown id → not found.
    assert_eq!(fx.engine.cancel(a).unwrap_err(), WatermarkError::NotCancellable);
    assert_eq!(fx.engine.cancel(Uuid::new_v4()).unwrap_err(), WatermarkError::NotFound);

    release.send(()).unwrap();
    let done = wait_terminal(&fx.engine, a);
    assert_eq!(done.status, JobStatus::Completed);

    // The cancelled id surfaced from the FIFO and was discarded, not run.
    assert_eq!(fx.runner.started_order(), vec![a]);

    // Terminal jobs are not cancellable either.
    assert_eq!(fx.engine.cancel(a).unwrap_err(), WatermarkError::NotCancellable);
}

#[test]
fn shutdown_aborts_in_flight_and_queued_jobs_cleanly() {
    let (runner, _release) = SyntheticRunner::gated();
    let fx = fixture(1, 100, runner);

    let a = fx.engine.submit_embed(Path::new("/videos/a.mp4"), "Hi", embed_opts()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while fx.engine.get_job(a).unwrap().status != JobStatus::Processing {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
    let b = fx.engine.submit_embed(Path::new("/videos/b.mp4"), "Hi", embed_opts()).unwrap();

    // Never released: `a` aborts via its stop flag, `b` never starts.
    fx.engine.shutdown();

    for id in [a, b] {
        let snap = fx.engine.get_job(id).unwrap();
        assert_eq!(snap.status, JobStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("shutdown"));
    }

    // No partial outputs survive shutdown.
    let leftovers: Vec<_> = std::fs::read_dir(&fx.work_dir)
        .map(|rd| rd.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "stray files: {leftovers:?}");

    // New submissions are refused.
    let err = fx.engine.submit_embed(Path::new("/videos/c.mp4"), "Hi", embed_opts()).unwrap_err();
    assert_eq!(err, WatermarkError::Shutdown);
}

#[test]
fn subscriber_sees_monotone_progress_ending_in_terminal() {
    let fx = fixture(1, 100, SyntheticRunner::new());
    let id = fx.engine.submit_embed(Path::new("/videos/a.mp4"), "Hi", embed_opts()).unwrap();
    let rx = fx.engine.subscribe(id).expect("job exists");

    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(ev) => events.push(ev),
            Err(_) => break, // disconnect: stream ended
        }
    }

    assert!(!events.is_empty());
    let last = events.last().unwrap();
    assert_eq!(last.status, JobStatus::Completed);
    assert_eq!(last.progress, 100.0);
    for pair in events.windows(2) {
        assert!(pair[1].progress >= pair[0].progress, "progress went backwards");
    }
}

#[test]
fn subscribing_to_a_finished_job_yields_one_terminal_event() {
    let fx = fixture(1, 100, SyntheticRunner::new());
    let id = fx.engine.submit_embed(Path::new("/videos/a.mp4"), "Hi", embed_opts()).unwrap();
    wait_terminal(&fx.engine, id);

    let rx = fx.engine.subscribe(id).expect("job exists");
    let ev = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(ev.status, JobStatus::Completed);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    assert!(fx.engine.subscribe(Uuid::new_v4()).is_none());
}

#[test]
fn terminal_jobs_are_evicted_beyond_retention() {
    let dirs = tempfile::tempdir().unwrap();
    let cfg = EngineConfig {
        workers: 1,
        retained_jobs: 2,
        ..EngineConfig::new(dirs.path().join("work"), dirs.path().join("out"))
    };
    let runner = Arc::new(SyntheticRunner::new());
    let engine =
        WatermarkEngine::with_runner(cfg, Arc::clone(&runner) as Arc<dyn JobRunner>).unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = engine
            .submit_embed(Path::new(&format!("/videos/{i}.mp4")), "Hi", embed_opts())
            .unwrap();
        wait_terminal(&engine, id);
        ids.push(id);
    }

    // Each submission prunes terminal entries past the cap, oldest first;
    // by now the first two jobs are gone and the most recent two remain.
    let last = engine.submit_embed(Path::new("/videos/last.mp4"), "Hi", embed_opts()).unwrap();
    assert!(engine.get_job(ids[0]).is_none());
    assert!(engine.get_job(ids[1]).is_none());
    assert!(engine.get_job(ids[2]).is_some());
    assert!(engine.get_job(ids[3]).is_some());

    wait_terminal(&engine, last);
    engine.shutdown();
}

#[test]
fn estimate_uses_probed_metadata() {
    let fx = fixture(1, 100, SyntheticRunner::new());
    // Synthetic probe: 300 frames at 360p → 300/30 · 0.5 · (0.5 + 14/32).
    let est = fx.engine.estimate(Path::new("/videos/a.mp4"), 14, 0.1);
    assert!((est.seconds - 300.0 / 30.0 * 0.5 * (0.5 + 14.0 / 32.0)).abs() < 1e-9);
    assert_eq!(est.confidence, 0.7);
}

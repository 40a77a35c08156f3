// crates/aquamark-media/src/engine.rs
//
// The process-wide scheduling surface: a bounded FIFO of pending jobs, a
// fixed worker pool, the job table, and the progress bus. One owning object
// with explicit construction and shutdown — workers receive their handle at
// spawn time and nothing lives in statics.
//
// Locking policy:
//   • The job table is one mutex with short critical sections; status reads
//     clone a snapshot.
//   • The bus has its own lock; publishing never holds the table lock.
//   • A job's decoder, scaler and writer are owned by the worker running it.
//
// Queue semantics: submission is non-blocking and rejects with `queue_full`
// at capacity. Cancellation of a queued job marks it terminal in the table;
// workers discard already-terminal ids when they surface from the queue, so
// the FIFO itself never needs surgery.
//
// Retention: terminal jobs stay in the table so late status queries resolve,
// bounded by cfg.retained_jobs. Submission evicts the oldest-finished
// entries past that cap; the completed-artifact channel is the durable
// record of finished embeds.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use anyhow::Context as _;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{info, warn};
use uuid::Uuid;

use aquamark_core::bits::encode_payload;
use aquamark_core::estimate::{self, Estimate};
use aquamark_core::job::{ArtifactRecord, ArtifactRef, Job, JobRequest, JobSnapshot, JobStatus};
use aquamark_core::options::{EmbedOptions, EngineConfig, ExtractOptions};
use aquamark_core::progress::{ProgressEvent, ProgressSink};
use aquamark_core::WatermarkError;

use crate::bus::ProgressBus;
use crate::probe::ValidationReport;
use crate::runner::{FfmpegRunner, JobRunner, RunInput, RunOutput};

/// Completed-artifact backlog for the storage collaborator. Old records are
/// dropped if nothing drains the channel.
const COMPLETED_BACKLOG: usize = 256;

struct Shared {
    cfg: EngineConfig,
    jobs: Mutex<HashMap<Uuid, Job>>,
    bus: ProgressBus,
    runner: Arc<dyn JobRunner>,
    stop_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    shutdown: AtomicBool,
    completed_tx: Sender<ArtifactRecord>,
}

pub struct WatermarkEngine {
    shared: Arc<Shared>,
    /// Dropped (set to None) at shutdown so workers see a disconnect.
    queue_tx: Mutex<Option<Sender<Uuid>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completed_rx: Receiver<ArtifactRecord>,
}

impl WatermarkEngine {
    /// Engine with the production ffmpeg runner.
    pub fn new(cfg: EngineConfig) -> anyhow::Result<Self> {
        Self::with_runner(cfg, Arc::new(FfmpegRunner))
    }

    /// Engine with a caller-supplied runner. The queue tests use this to run
    /// without video fixtures.
    pub fn with_runner(cfg: EngineConfig, runner: Arc<dyn JobRunner>) -> anyhow::Result<Self> {
        fs::create_dir_all(&cfg.work_dir)
            .with_context(|| format!("create work dir {}", cfg.work_dir.display()))?;
        fs::create_dir_all(&cfg.output_dir)
            .with_context(|| format!("create output dir {}", cfg.output_dir.display()))?;

        let (queue_tx, queue_rx) = bounded::<Uuid>(cfg.queue_cap);
        let (completed_tx, completed_rx) = bounded::<ArtifactRecord>(COMPLETED_BACKLOG);

        let shared = Arc::new(Shared {
            cfg,
            jobs: Mutex::new(HashMap::new()),
            bus: ProgressBus::new(),
            runner,
            stop_flags: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            completed_tx,
        });

        let mut workers = Vec::new();
        for i in 0..shared.cfg.workers.max(1) {
            let shared = Arc::clone(&shared);
            let rx = queue_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("aquamark-worker-{i}"))
                .spawn(move || worker_loop(shared, rx))
                .context("spawn worker thread")?;
            workers.push(handle);
        }
        info!(target: "engine", workers = workers.len(), queue_cap = shared.cfg.queue_cap, "engine up");

        Ok(WatermarkEngine {
            shared,
            queue_tx: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(workers),
            completed_rx,
        })
    }

    pub fn submit_embed(
        &self,
        input: &Path,
        payload: &str,
        options: EmbedOptions,
    ) -> Result<Uuid, WatermarkError> {
        options.validate()?;
        // Bounds-check the payload now; the runner re-encodes it at run time.
        encode_payload(payload, options.sentinel)?;
        self.submit(input, JobRequest::Embed { payload: payload.to_owned(), options })
    }

    pub fn submit_extract(
        &self,
        input: &Path,
        options: ExtractOptions,
    ) -> Result<Uuid, WatermarkError> {
        options.validate()?;
        self.submit(input, JobRequest::Extract { options })
    }

    fn submit(&self, input: &Path, request: JobRequest) -> Result<Uuid, WatermarkError> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(WatermarkError::Shutdown);
        }

        let report = self.shared.runner.validate(input, self.shared.cfg.max_file_size);
        if !report.is_valid() {
            let detail = if report.errors.is_empty() {
                "no decodable video stream".to_owned()
            } else {
                report.errors.join("; ")
            };
            return Err(WatermarkError::InvalidInput(detail));
        }

        let id = Uuid::new_v4();
        let job = Job::new(id, input.to_path_buf(), request);

        let guard = self.queue_tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Err(WatermarkError::Shutdown);
        };

        {
            let mut jobs = self.shared.jobs.lock().unwrap();
            evict_terminal(&mut jobs, self.shared.cfg.retained_jobs);
            jobs.insert(id, job);
        }
        self.shared.stop_flags.lock().unwrap().insert(id, Arc::new(AtomicBool::new(false)));

        if tx.try_send(id).is_err() {
            // Roll back so a rejected submission leaves the table unchanged.
            self.shared.jobs.lock().unwrap().remove(&id);
            self.shared.stop_flags.lock().unwrap().remove(&id);
            return Err(WatermarkError::QueueFull);
        }

        info!(target: "engine", job = %id, input = %input.display(), "queued");
        Ok(id)
    }

    pub fn validate(&self, path: &Path) -> ValidationReport {
        self.shared.runner.validate(path, self.shared.cfg.max_file_size)
    }

    /// Advisory cost prediction; never gates execution. `_strength` is part
    /// of the public shape but does not move the estimate.
    pub fn estimate(&self, path: &Path, payload_len: usize, _strength: f32) -> Estimate {
        let report = self.validate(path);
        estimate::estimate(
            report.frame_count.unwrap_or(0),
            report.height.unwrap_or(0),
            payload_len,
            report.metadata_complete(),
        )
    }

    pub fn get_job(&self, id: Uuid) -> Option<JobSnapshot> {
        self.shared.jobs.lock().unwrap().get(&id).map(Job::snapshot)
    }

    /// Stream of progress events for one job, ending after its terminal
    /// transition. A job that is already terminal yields exactly one event.
    pub fn subscribe(&self, id: Uuid) -> Option<Receiver<ProgressEvent>> {
        // Registration happens under the table lock so a terminal transition
        // cannot slip between the status check and the bus registration.
        let jobs = self.shared.jobs.lock().unwrap();
        let job = jobs.get(&id)?;
        if job.status.is_terminal() {
            let (tx, rx) = bounded(1);
            let _ = tx.try_send(status_event(job));
            Some(rx)
        } else {
            Some(self.shared.bus.subscribe(id))
        }
    }

    /// Cancel a queued job. Running and finished jobs are not cancellable in
    /// the baseline design.
    pub fn cancel(&self, id: Uuid) -> Result<(), WatermarkError> {
        let event = {
            let mut jobs = self.shared.jobs.lock().unwrap();
            let job = jobs.get_mut(&id).ok_or(WatermarkError::NotFound)?;
            match job.status {
                JobStatus::Queued => {
                    job.mark_error(WatermarkError::Cancelled);
                    status_event(job)
                }
                _ => return Err(WatermarkError::NotCancellable),
            }
        };
        // The id still sits in the FIFO; the dequeuing worker sees the
        // terminal status and discards it.
        self.shared.bus.publish_terminal(&event);
        self.shared.stop_flags.lock().unwrap().remove(&id);
        info!(target: "engine", job = %id, "cancelled while queued");
        Ok(())
    }

    /// Registry contract: one record per completed embed, drained by the
    /// storage collaborator.
    pub fn completed_artifacts(&self) -> Receiver<ArtifactRecord> {
        self.completed_rx.clone()
    }

    /// Stop accepting jobs, let in-flight workers finish or abort, flush the
    /// bus, and remove stray partial outputs. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "engine", "shutdown requested");

        // Disconnect the queue: workers drain buffered ids and exit.
        *self.queue_tx.lock().unwrap() = None;

        // Abort in-flight pipelines at their next frame boundary.
        for flag in self.shared.stop_flags.lock().unwrap().values() {
            flag.store(true, Ordering::Relaxed);
        }

        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        // Anything still non-terminal never reached a worker.
        let events: Vec<ProgressEvent> = {
            let mut jobs = self.shared.jobs.lock().unwrap();
            jobs.values_mut()
                .filter(|j| !j.status.is_terminal())
                .map(|j| {
                    j.mark_error(WatermarkError::Shutdown);
                    status_event(j)
                })
                .collect()
        };
        for event in &events {
            self.shared.bus.publish_terminal(event);
        }
        self.shared.bus.clear();
        self.shared.stop_flags.lock().unwrap().clear();

        // Partial outputs must not survive shutdown.
        if let Ok(entries) = fs::read_dir(&self.shared.cfg.work_dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().ends_with(".part.mp4") {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        info!(target: "engine", "shutdown complete");
    }
}

impl Drop for WatermarkEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Event mirroring a job's current observable state. Used for both the
/// `processing` transition and terminal transitions.
fn status_event(job: &Job) -> ProgressEvent {
    ProgressEvent::new(job.id, job.status, job.progress, job.message.clone())
}

/// Drop the oldest-finished terminal jobs once more than `keep` of them sit
/// in the table. Active jobs are never touched.
fn evict_terminal(jobs: &mut HashMap<Uuid, Job>, keep: usize) {
    let terminal = jobs.values().filter(|j| j.status.is_terminal()).count();
    if terminal <= keep {
        return;
    }
    let mut finished: Vec<(SystemTime, Uuid)> = jobs
        .values()
        .filter(|j| j.status.is_terminal())
        .map(|j| (j.finished_at.unwrap_or(SystemTime::UNIX_EPOCH), j.id))
        .collect();
    finished.sort();
    for (_, id) in finished.into_iter().take(terminal - keep) {
        jobs.remove(&id);
    }
}

/// Forwards pipeline progress into the table (monotone) and onto the bus.
struct WorkerSink {
    shared: Arc<Shared>,
    job_id: Uuid,
}

impl ProgressSink for WorkerSink {
    fn progress(&self, percent: f32, message: &str) {
        let event = {
            let mut jobs = self.shared.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(&self.job_id) else { return };
            job.update_progress(percent, message);
            ProgressEvent::new(job.id, job.status, job.progress, message)
        };
        self.shared.bus.publish(&event);
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<Uuid>) {
    while let Ok(job_id) = rx.recv() {
        if shared.shutdown.load(Ordering::Relaxed) {
            fail_before_start(&shared, job_id, WatermarkError::Shutdown);
            continue;
        }
        process_job(&shared, job_id);
    }
}

/// Terminal-fail a job that never started (shutdown drained it from the
/// queue before any worker could run it).
fn fail_before_start(shared: &Arc<Shared>, job_id: Uuid, error: WatermarkError) {
    let event = {
        let mut jobs = shared.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.mark_error(error);
                Some(status_event(job))
            }
            _ => None,
        }
    };
    if let Some(event) = event {
        shared.bus.publish_terminal(&event);
    }
    shared.stop_flags.lock().unwrap().remove(&job_id);
}

fn process_job(shared: &Arc<Shared>, job_id: Uuid) {
    let stop = shared
        .stop_flags
        .lock()
        .unwrap()
        .get(&job_id)
        .cloned()
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

    // queued → processing, unless a cancel already made the entry terminal.
    let work = {
        let mut jobs = shared.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.mark_processing();
                Some((job.input.clone(), job.request.clone(), status_event(job)))
            }
            _ => None,
        }
    };
    let Some((input, request, start_event)) = work else {
        shared.stop_flags.lock().unwrap().remove(&job_id);
        return;
    };
    shared.bus.publish(&start_event);
    info!(target: "engine", job = %job_id, "processing");

    let staging = shared.cfg.work_dir.join(format!("{job_id}.part.mp4"));
    let sink = WorkerSink { shared: Arc::clone(shared), job_id };

    let result = shared.runner.run(RunInput {
        job_id,
        input: &input,
        request: &request,
        staging: &staging,
        progress_interval: shared.cfg.progress_interval,
        stop: &stop,
        sink: &sink,
    });

    let event = match result {
        Ok(RunOutput::Embedded { frames }) => match finalize_embed(shared, job_id, &input, &staging) {
            Ok((artifact, record)) => {
                let event = {
                    let mut jobs = shared.jobs.lock().unwrap();
                    let job = jobs.get_mut(&job_id).expect("job vanished mid-processing");
                    job.mark_completed_embed(artifact);
                    status_event(job)
                };
                // Best-effort registry event; a full backlog loses the oldest
                // consumer slot, not the job itself.
                let _ = shared.completed_tx.try_send(record);
                info!(target: "engine", job = %job_id, frames, "completed");
                event
            }
            Err(e) => fail_job(shared, job_id, &staging, e),
        },
        Ok(RunOutput::Extracted(decoded)) => {
            let event = {
                let mut jobs = shared.jobs.lock().unwrap();
                let job = jobs.get_mut(&job_id).expect("job vanished mid-processing");
                job.mark_completed_extract(decoded);
                status_event(job)
            };
            info!(target: "engine", job = %job_id, "completed");
            event
        }
        Err(e) => fail_job(shared, job_id, &staging, e),
    };

    shared.bus.publish_terminal(&event);
    shared.stop_flags.lock().unwrap().remove(&job_id);
}

/// Move the staged output into the finalized directory and build the
/// registry record.
fn finalize_embed(
    shared: &Arc<Shared>,
    job_id: Uuid,
    input: &Path,
    staging: &Path,
) -> Result<(ArtifactRef, ArtifactRecord), WatermarkError> {
    let output_path = shared.cfg.output_dir.join(format!("{job_id}.mp4"));
    fs::rename(staging, &output_path)
        .map_err(|e| WatermarkError::Internal(format!("finalize output: {e}")))?;
    let size = fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
    let original_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let artifact = ArtifactRef { output_path: output_path.clone(), size };
    let record = ArtifactRecord {
        job_id,
        original_name,
        output_path,
        size,
        finished_at: SystemTime::now(),
    };
    Ok((artifact, record))
}

/// Terminal error path: delete the partial output, record the error.
fn fail_job(
    shared: &Arc<Shared>,
    job_id: Uuid,
    staging: &Path,
    error: WatermarkError,
) -> ProgressEvent {
    let _ = fs::remove_file(staging);
    warn!(target: "engine", job = %job_id, kind = error.kind(), %error, "job failed");
    let mut jobs = shared.jobs.lock().unwrap();
    let job = jobs.get_mut(&job_id).expect("job vanished mid-processing");
    job.mark_error(error);
    status_event(job)
}


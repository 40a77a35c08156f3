// crates/aquamark-core/src/job.rs
//
// Per-video job state machine. A Job is created at submit time, mutated only
// by the queue (dequeue) and its owning worker, and never touched by two
// threads at once — the engine's table lock guarantees that. Status moves
// monotonically through queued → processing → (completed | error) with no
// reversals; progress never decreases while processing.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bits::DecodedPayload;
use crate::error::WatermarkError;
use crate::options::{EmbedOptions, ExtractOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Embed,
    Extract,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// What a submitted job is asked to do.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JobRequest {
    Embed { payload: String, options: EmbedOptions },
    Extract { options: ExtractOptions },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Embed { .. } => JobKind::Embed,
            JobRequest::Extract { .. } => JobKind::Extract,
        }
    }
}

/// Where a completed embed landed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub output_path: PathBuf,
    pub size: u64,
}

/// The registry event published for the storage collaborator when an embed
/// job completes. The core never writes the registry itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub job_id: Uuid,
    pub original_name: String,
    pub output_path: PathBuf,
    pub size: u64,
    pub finished_at: SystemTime,
}

/// One unit of work and its observable lifecycle state.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: Uuid,
    pub input: PathBuf,
    pub request: JobRequest,
    pub status: JobStatus,
    /// Percent in [0, 100]; non-decreasing while processing.
    pub progress: f32,
    /// Free-form observable status line.
    pub message: String,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    /// Set iff status == Completed for an embed job.
    pub result: Option<ArtifactRef>,
    /// Set iff status == Completed for an extract job.
    pub recovered: Option<DecodedPayload>,
    /// Set iff status == Error.
    pub error: Option<WatermarkError>,
}

impl Job {
    pub fn new(id: Uuid, input: PathBuf, request: JobRequest) -> Self {
        Job {
            id,
            input,
            request,
            status: JobStatus::Queued,
            progress: 0.0,
            message: "queued".into(),
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            result: None,
            recovered: None,
            error: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.request.kind()
    }

    /// queued → processing. Called exactly once, by the dequeuing worker.
    pub fn mark_processing(&mut self) {
        debug_assert_eq!(self.status, JobStatus::Queued);
        self.status = JobStatus::Processing;
        self.started_at = Some(SystemTime::now());
        self.message = "processing".into();
    }

    /// Monotone progress update while processing.
    pub fn update_progress(&mut self, percent: f32, message: impl Into<String>) {
        if self.status != JobStatus::Processing {
            return;
        }
        self.progress = self.progress.max(percent.clamp(0.0, 100.0));
        self.message = message.into();
    }

    pub fn mark_completed_embed(&mut self, artifact: ArtifactRef) {
        debug_assert_eq!(self.status, JobStatus::Processing);
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.message = "completed".into();
        self.finished_at = Some(SystemTime::now());
        self.result = Some(artifact);
    }

    pub fn mark_completed_extract(&mut self, recovered: DecodedPayload) {
        debug_assert_eq!(self.status, JobStatus::Processing);
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.message = format!("recovered {} bytes", recovered.text.len());
        self.finished_at = Some(SystemTime::now());
        self.recovered = Some(recovered);
    }

    /// Terminal failure from either queued (cancel) or processing (worker).
    pub fn mark_error(&mut self, error: WatermarkError) {
        debug_assert!(!self.status.is_terminal());
        self.status = JobStatus::Error;
        self.message = error.to_string();
        self.finished_at = Some(SystemTime::now());
        self.error = Some(error);
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            kind: self.kind(),
            input: self.input.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            recovered: self.recovered.clone(),
            error: self.error.as_ref().map(|e| e.kind().to_string()),
        }
    }
}

/// The cloneable view handed to status queries and the adapter layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub kind: JobKind,
    pub input: PathBuf,
    pub status: JobStatus,
    pub progress: f32,
    pub message: String,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub result: Option<ArtifactRef>,
    pub recovered: Option<DecodedPayload>,
    /// Machine-readable error kind, when status == error.
    pub error: Option<String>,
}

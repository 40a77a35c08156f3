// crates/aquamark-core/src/progress.rs
//
// Progress events and the opaque sink the pipeline reports through. The
// pipeline never sees the bus — the worker hands it a sink that forwards to
// whatever is listening.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobStatus;

/// One observable step of a job. Intermediate events are lossy; the terminal
/// event (status completed/error) is published at-least-once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: f32,
    pub message: String,
    pub timestamp: SystemTime,
}

impl ProgressEvent {
    pub fn new(job_id: Uuid, status: JobStatus, progress: f32, message: impl Into<String>) -> Self {
        ProgressEvent {
            job_id,
            status,
            progress,
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Where the per-frame loop reports progress. Implementations must not
/// block — a slow consumer is the bus's problem, not the pipeline's.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, percent: f32, message: &str);
}

/// Sink that discards everything. Used by one-shot CLI paths and tests.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _percent: f32, _message: &str) {}
}

/// Adapter turning a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(f32, &str) + Send + Sync,
{
    fn progress(&self, percent: f32, message: &str) {
        (self.0)(percent, message)
    }
}

// crates/aquamark-core/src/error.rs
//
// The closed set of error kinds the engine surfaces. Everything a worker can
// fail with maps onto one of these; the media crate converts its internal
// anyhow errors at the job boundary.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WatermarkError {
    /// Path missing, unreadable, zero/oversized, magic mismatch, unsupported
    /// container, or a malformed request. Rejected before enqueue.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Frame block capacity cannot hold the redundant bit stream for the
    /// chosen carriers. Raised before any block is modified.
    #[error("payload needs {needed} blocks but the frame provides {capacity}")]
    CapacityInsufficient { needed: usize, capacity: usize },

    /// DCT / scale / encoder failure on a specific frame. The job aborts and
    /// any partial output is deleted.
    #[error("processing failed on frame {frame}: {reason}")]
    FrameProcessingFailed { frame: u64, reason: String },

    /// Unrecoverable read from the input container.
    #[error("decoder error: {0}")]
    DecoderError(String),

    /// Submission rejected: the pending queue is at capacity.
    #[error("job queue is full")]
    QueueFull,

    /// Cancel was requested for a job that is already running or finished.
    #[error("job is not cancellable")]
    NotCancellable,

    /// The job id is unknown to the engine.
    #[error("job not found")]
    NotFound,

    /// A queued job was cancelled by the caller before a worker picked it up.
    #[error("cancelled before processing")]
    Cancelled,

    /// The worker aborted because the engine is shutting down.
    #[error("aborted by shutdown")]
    Shutdown,

    /// Invariant violation that should never happen. Logged for diagnosis.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WatermarkError {
    /// Stable machine-readable kind tag, used in snapshots and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            WatermarkError::InvalidInput(_) => "invalid_input",
            WatermarkError::CapacityInsufficient { .. } => "capacity_insufficient",
            WatermarkError::FrameProcessingFailed { .. } => "frame_processing_failed",
            WatermarkError::DecoderError(_) => "decoder_error",
            WatermarkError::QueueFull => "queue_full",
            WatermarkError::NotCancellable => "not_cancellable",
            WatermarkError::NotFound => "not_found",
            WatermarkError::Cancelled => "cancelled",
            WatermarkError::Shutdown => "shutdown",
            WatermarkError::Internal(_) => "internal",
        }
    }
}

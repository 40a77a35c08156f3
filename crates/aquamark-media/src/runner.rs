// crates/aquamark-media/src/runner.rs
//
// The seam between the scheduling engine and the actual video work. The
// engine validates, queues, schedules and reports through this trait; the
// production implementation drives the ffmpeg pipelines, and the queue tests
// install a synthetic runner so they need no fixtures.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use uuid::Uuid;

use aquamark_core::bits::{encode_payload, DecodedPayload};
use aquamark_core::job::JobRequest;
use aquamark_core::progress::ProgressSink;
use aquamark_core::WatermarkError;

use crate::pipeline;
use crate::probe::{self, ValidationReport};

/// Everything a runner needs for one job. The staging path is where an embed
/// job writes its output; the engine renames it into place on success.
pub struct RunInput<'a> {
    pub job_id: Uuid,
    pub input: &'a Path,
    pub request: &'a JobRequest,
    pub staging: &'a Path,
    pub progress_interval: u64,
    pub stop: &'a AtomicBool,
    pub sink: &'a dyn ProgressSink,
}

/// What a successful run produced.
pub enum RunOutput {
    Embedded { frames: u64 },
    Extracted(DecodedPayload),
}

pub trait JobRunner: Send + Sync + 'static {
    fn validate(&self, path: &Path, max_file_size: u64) -> ValidationReport;
    fn run(&self, input: RunInput<'_>) -> Result<RunOutput, WatermarkError>;
}

/// Production runner: ffmpeg probe + pipelines.
pub struct FfmpegRunner;

impl JobRunner for FfmpegRunner {
    fn validate(&self, path: &Path, max_file_size: u64) -> ValidationReport {
        probe::validate(path, max_file_size)
    }

    fn run(&self, input: RunInput<'_>) -> Result<RunOutput, WatermarkError> {
        match input.request {
            JobRequest::Embed { payload, options } => {
                let bits = encode_payload(payload, options.sentinel)?;
                let frames = pipeline::embed_video(
                    input.input,
                    input.staging,
                    &bits,
                    options,
                    input.progress_interval,
                    input.sink,
                    input.stop,
                )?;
                Ok(RunOutput::Embedded { frames })
            }
            JobRequest::Extract { options } => {
                let outcome =
                    pipeline::extract_video(input.input, options, input.sink, input.stop)?;
                Ok(RunOutput::Extracted(outcome.decoded))
            }
        }
    }
}

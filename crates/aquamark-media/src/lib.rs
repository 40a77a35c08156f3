// crates/aquamark-media/src/lib.rs

pub mod bus;
pub mod engine;
pub mod pipeline;
pub mod probe;
pub mod runner;

pub use bus::ProgressBus;
pub use engine::WatermarkEngine;
pub use pipeline::{embed_video, extract_video, ExtractOutcome};
pub use probe::{validate, ValidationReport};
pub use runner::{FfmpegRunner, JobRunner, RunInput, RunOutput};

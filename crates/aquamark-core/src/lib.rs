// crates/aquamark-core/src/lib.rs
//
// Pure data and math for DCT-domain video watermarking. No ffmpeg, no
// threads, no I/O — the media crate owns all of that.

pub mod bits;
pub mod dct;
pub mod error;
pub mod estimate;
pub mod frame;
pub mod job;
pub mod options;
pub mod planes;
pub mod progress;

pub use bits::{Confidence, DecodedPayload, MAX_PAYLOAD_BYTES};
pub use error::WatermarkError;
pub use frame::{BitVotes, FrameWatermarker};
pub use job::{ArtifactRecord, ArtifactRef, Job, JobKind, JobRequest, JobSnapshot, JobStatus};
pub use options::{EmbedOptions, EngineConfig, ExtractOptions};
pub use planes::{Carrier, PlaneSet};
pub use progress::{FnSink, NullSink, ProgressEvent, ProgressSink};

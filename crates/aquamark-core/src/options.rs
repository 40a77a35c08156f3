// crates/aquamark-core/src/options.rs
//
// Job options and engine configuration. Plain serde data — no runtime
// handles — so the adapter layer can pass these straight through.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::WatermarkError;
use crate::planes::Carrier;

/// Lowest accepted embedding strength.
pub const MIN_STRENGTH: f32 = 0.05;
/// Highest accepted embedding strength.
pub const MAX_STRENGTH: f32 = 0.30;

/// How an embed job modifies the video.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbedOptions {
    /// Coefficient modification strength in [0.05, 0.30].
    #[serde(default = "default_strength")]
    pub strength: f32,
    /// Which planes carry bits.
    #[serde(default)]
    pub carrier: Carrier,
    /// How many blocks carry each payload bit.
    #[serde(default = "default_redundancy")]
    pub redundancy: usize,
    /// Append the end-of-message sentinel so extraction can run without a
    /// known payload length.
    #[serde(default = "default_true")]
    pub sentinel: bool,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        EmbedOptions {
            strength: default_strength(),
            carrier: Carrier::Luma,
            redundancy: default_redundancy(),
            sentinel: true,
        }
    }
}

impl EmbedOptions {
    pub fn validate(&self) -> Result<(), WatermarkError> {
        if !(MIN_STRENGTH..=MAX_STRENGTH).contains(&self.strength) {
            return Err(WatermarkError::InvalidInput(format!(
                "strength {} outside [{MIN_STRENGTH}, {MAX_STRENGTH}]",
                self.strength,
            )));
        }
        if self.redundancy == 0 {
            return Err(WatermarkError::InvalidInput("redundancy must be at least 1".into()));
        }
        Ok(())
    }
}

/// How an extract job reads the video. Carrier, redundancy and strength must
/// match the embedding; defaults mirror `EmbedOptions`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractOptions {
    /// Payload length in bytes when the caller knows it. `None` relies on
    /// the sentinel.
    pub expected_bytes: Option<usize>,
    #[serde(default = "default_strength")]
    pub strength: f32,
    #[serde(default)]
    pub carrier: Carrier,
    #[serde(default = "default_redundancy")]
    pub redundancy: usize,
    /// Upper bound on scanned frames; voting may stop earlier once every bit
    /// is confidently decided.
    #[serde(default = "default_max_frames")]
    pub max_frames: u64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            expected_bytes: None,
            strength: default_strength(),
            carrier: Carrier::Luma,
            redundancy: default_redundancy(),
            max_frames: default_max_frames(),
        }
    }
}

impl ExtractOptions {
    pub fn validate(&self) -> Result<(), WatermarkError> {
        if !(MIN_STRENGTH..=MAX_STRENGTH).contains(&self.strength) {
            return Err(WatermarkError::InvalidInput(format!(
                "strength {} outside [{MIN_STRENGTH}, {MAX_STRENGTH}]",
                self.strength,
            )));
        }
        if self.redundancy == 0 {
            return Err(WatermarkError::InvalidInput("redundancy must be at least 1".into()));
        }
        if self.max_frames == 0 {
            return Err(WatermarkError::InvalidInput("max_frames must be at least 1".into()));
        }
        Ok(())
    }
}

/// Engine-wide configuration: queue bounds, worker pool size, directories.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pending-queue capacity; submissions beyond this are rejected.
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,
    /// Worker pool size. Defaults to available cores, capped at 4.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Largest accepted input file in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// In-flight outputs live here as `<job_id>.part.mp4`.
    pub work_dir: PathBuf,
    /// Finalized outputs are renamed into this directory.
    pub output_dir: PathBuf,
    /// Publish a progress event every this many frames.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    /// How many terminal jobs stay queryable in the table before the
    /// oldest-finished ones are evicted.
    #[serde(default = "default_retained_jobs")]
    pub retained_jobs: usize,
}

impl EngineConfig {
    pub fn new(work_dir: PathBuf, output_dir: PathBuf) -> Self {
        EngineConfig {
            queue_cap: default_queue_cap(),
            workers: default_workers(),
            max_file_size: default_max_file_size(),
            work_dir,
            output_dir,
            progress_interval: default_progress_interval(),
            retained_jobs: default_retained_jobs(),
        }
    }
}

fn default_strength() -> f32 {
    0.1
}

fn default_redundancy() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_frames() -> u64 {
    30
}

fn default_queue_cap() -> usize {
    100
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(4)
}

fn default_max_file_size() -> u64 {
    500 * 1024 * 1024
}

fn default_progress_interval() -> u64 {
    10
}

fn default_retained_jobs() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let opts = EmbedOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.redundancy, 3);
        assert!(opts.sentinel);
        assert!(ExtractOptions::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_strength_is_rejected() {
        let opts = EmbedOptions { strength: 0.4, ..Default::default() };
        assert!(matches!(opts.validate(), Err(WatermarkError::InvalidInput(_))));
        let opts = EmbedOptions { strength: 0.01, ..Default::default() };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn engine_config_defaults() {
        let cfg = EngineConfig::new("/tmp/work".into(), "/tmp/out".into());
        assert_eq!(cfg.queue_cap, 100);
        assert_eq!(cfg.progress_interval, 10);
        assert_eq!(cfg.retained_jobs, 256);
        assert!((1..=4).contains(&cfg.workers));
    }

    #[test]
    fn options_round_trip_as_json() {
        let opts = EmbedOptions { carrier: Carrier::LumaChroma, ..Default::default() };
        let json = serde_json::to_string(&opts).unwrap();
        let back: EmbedOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let opts: ExtractOptions = serde_json::from_str(r#"{"expected_bytes": 14}"#).unwrap();
        assert_eq!(opts.expected_bytes, Some(14));
        assert_eq!(opts.redundancy, 3);
        assert_eq!(opts.max_frames, 30);
    }
}

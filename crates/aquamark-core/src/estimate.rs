// crates/aquamark-core/src/estimate.rs
//
// Advisory wall-clock prediction for a job. Never gates execution — the
// adapter shows it to users deciding whether to wait.

use serde::{Deserialize, Serialize};

/// Frames per second one reference core processes at 1×720p scale.
const BASE_RATE: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub seconds: f64,
    /// 0.7 when the video's metadata was fully known, 0.4 otherwise.
    pub confidence: f64,
}

/// Cost multiplier by vertical resolution class.
fn resolution_factor(height: u32) -> f64 {
    match height {
        0..=480 => 0.5,
        481..=720 => 1.0,
        721..=1080 => 1.5,
        1081..=2160 => 3.0,
        _ => 5.0,
    }
}

/// Longer payloads touch more blocks per frame.
fn payload_factor(payload_len: usize) -> f64 {
    0.5 + (payload_len as f64 / 32.0).min(1.5)
}

/// Predict processing time for `frame_count` frames at the given resolution.
///
/// `metadata_complete` reflects whether the caller actually knew the frame
/// count and dimensions, or had to guess; it only affects the confidence.
pub fn estimate(
    frame_count: u64,
    height: u32,
    payload_len: usize,
    metadata_complete: bool,
) -> Estimate {
    let seconds =
        frame_count as f64 / BASE_RATE * resolution_factor(height) * payload_factor(payload_len);
    Estimate { seconds, confidence: if metadata_complete { 0.7 } else { 0.4 } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_classes() {
        assert_eq!(resolution_factor(360), 0.5);
        assert_eq!(resolution_factor(480), 0.5);
        assert_eq!(resolution_factor(720), 1.0);
        assert_eq!(resolution_factor(1080), 1.5);
        assert_eq!(resolution_factor(2160), 3.0);
        assert_eq!(resolution_factor(4320), 5.0);
    }

    #[test]
    fn payload_factor_saturates() {
        assert_eq!(payload_factor(0), 0.5);
        assert_eq!(payload_factor(16), 1.0);
        assert_eq!(payload_factor(48), 2.0);
        assert_eq!(payload_factor(1000), 2.0);
    }

    #[test]
    fn estimate_scales_linearly_with_frames() {
        let a = estimate(300, 720, 16, true);
        let b = estimate(600, 720, 16, true);
        assert!((b.seconds - 2.0 * a.seconds).abs() < 1e-9);
        assert_eq!(a.confidence, 0.7);
    }

    #[test]
    fn unknown_metadata_lowers_confidence() {
        assert_eq!(estimate(100, 0, 8, false).confidence, 0.4);
    }
}

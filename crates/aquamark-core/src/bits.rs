// crates/aquamark-core/src/bits.rs
//
// Payload framing: UTF-8 text ⇄ MSB-first bit stream.
//
// Each code unit expands to 8 bits, most significant first. An optional
// 16-bit end-of-message sentinel lets extraction recover the payload length
// from the bit stream itself instead of requiring the caller to supply it.
// Decoding is lossy-tolerant: invalid UTF-8 becomes U+FFFD, and a qualitative
// confidence is derived from how strongly the redundant block votes agreed.

use serde::{Deserialize, Serialize};

use crate::error::WatermarkError;

/// Maximum payload length in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 50;

/// End-of-message sentinel: fifteen ones followed by a zero. Byte-aligned
/// (the payload is always whole bytes), so extraction scans at bit offsets
/// that are multiples of 8.
pub const SENTINEL: [u8; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0];

/// Qualitative decode confidence, derived from per-bit vote agreement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Map a mean agreement ratio in [0, 1] onto the three-step scale.
    pub fn from_agreement(agreement: f64) -> Self {
        if agreement >= 0.9 {
            Confidence::High
        } else if agreement >= 0.7 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// Result of decoding a recovered bit stream back to text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedPayload {
    pub text: String,
    pub confidence: Confidence,
    /// Mean per-bit agreement ratio the confidence was derived from.
    pub agreement: f64,
}

impl DecodedPayload {
    fn empty() -> Self {
        DecodedPayload { text: String::new(), confidence: Confidence::Low, agreement: 0.0 }
    }
}

/// Expand `text` to its embedded bit form: 8 bits per byte, MSB first,
/// followed by the sentinel when `with_sentinel` is set.
pub fn encode_payload(text: &str, with_sentinel: bool) -> Result<Vec<u8>, WatermarkError> {
    if text.is_empty() {
        return Err(WatermarkError::InvalidInput("payload is empty".into()));
    }
    if text.len() > MAX_PAYLOAD_BYTES {
        return Err(WatermarkError::InvalidInput(format!(
            "payload is {} bytes, maximum is {MAX_PAYLOAD_BYTES}",
            text.len(),
        )));
    }

    let mut bits = Vec::with_capacity(text.len() * 8 + if with_sentinel { 16 } else { 0 });
    for byte in text.bytes() {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1);
        }
    }
    if with_sentinel {
        bits.extend_from_slice(&SENTINEL);
    }
    Ok(bits)
}

/// Number of embedded bits for a payload of `bytes` bytes.
pub fn payload_bits(bytes: usize, with_sentinel: bool) -> usize {
    bytes * 8 + if with_sentinel { 16 } else { 0 }
}

/// Decode a majority-voted bit stream back to text.
///
/// `expected_bytes` is the payload length when the caller knows it; otherwise
/// the stream is scanned for the sentinel at byte-aligned offsets and
/// truncated there. `agreement` is the mean per-bit vote agreement reported
/// by the extractor; it only feeds the confidence category.
///
/// Returns an empty string with `Low` confidence when a required sentinel is
/// missing or when the decoded text is mostly non-printable (the usual shape
/// of a failed extraction: coin-flip bits decode to control characters).
pub fn decode_payload(bits: &[u8], expected_bytes: Option<usize>, agreement: f64) -> DecodedPayload {
    let payload_bits = match expected_bytes {
        Some(n) => {
            if bits.len() < n * 8 {
                return DecodedPayload::empty();
            }
            n * 8
        }
        None => match sentinel_offset(bits) {
            Some(offset) => offset,
            None => return DecodedPayload::empty(),
        },
    };

    let mut bytes = Vec::with_capacity(payload_bits / 8);
    for chunk in bits[..payload_bits].chunks_exact(8) {
        let mut b = 0u8;
        for &bit in chunk {
            b = (b << 1) | (bit & 1);
        }
        bytes.push(b);
    }

    let text = String::from_utf8_lossy(&bytes).into_owned();
    if !mostly_printable(&text) {
        return DecodedPayload::empty();
    }

    DecodedPayload { text, confidence: Confidence::from_agreement(agreement), agreement }
}

/// Find the byte-aligned bit offset of the sentinel, if present. The
/// extractor uses this to bound both the decoded payload and the agreement
/// window when no expected length was supplied.
pub fn sentinel_offset(bits: &[u8]) -> Option<usize> {
    if bits.len() < SENTINEL.len() {
        return None;
    }
    (0..=bits.len() - SENTINEL.len())
        .step_by(8)
        .find(|&off| bits[off..off + SENTINEL.len()] == SENTINEL)
}

/// True when more than half of the code points are printable. U+FFFD counts
/// as non-printable so heavily corrupted streams fail this check.
fn mostly_printable(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return false;
    }
    let printable = text
        .chars()
        .filter(|&c| c != char::REPLACEMENT_CHARACTER && (!c.is_control() || c == '\t' || c == '\n'))
        .count();
    printable * 2 > total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_msb_first() {
        // 'H' = 0x48 = 0100_1000
        let bits = encode_payload("H", false).unwrap();
        assert_eq!(bits, vec![0, 1, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn encode_appends_sentinel() {
        let bits = encode_payload("Hi", true).unwrap();
        assert_eq!(bits.len(), 32);
        assert_eq!(&bits[16..], &SENTINEL);
    }

    #[test]
    fn round_trip_with_known_length() {
        let bits = encode_payload("Copyright 2024", false).unwrap();
        let decoded = decode_payload(&bits, Some(14), 1.0);
        assert_eq!(decoded.text, "Copyright 2024");
        assert_eq!(decoded.confidence, Confidence::High);
    }

    #[test]
    fn round_trip_via_sentinel() {
        let bits = encode_payload("Hi", true).unwrap();
        let decoded = decode_payload(&bits, None, 0.95);
        assert_eq!(decoded.text, "Hi");
        assert_eq!(decoded.confidence, Confidence::High);
    }

    #[test]
    fn missing_sentinel_decodes_empty() {
        let bits = encode_payload("Hi", false).unwrap();
        let decoded = decode_payload(&bits, None, 1.0);
        assert_eq!(decoded.text, "");
        assert_eq!(decoded.confidence, Confidence::Low);
    }

    #[test]
    fn garbage_bits_decode_empty() {
        // 0x07 repeated — control characters, the usual shape of a failed
        // extraction.
        let bits: Vec<u8> = [0, 0, 0, 0, 0, 1, 1, 1].repeat(8);
        let decoded = decode_payload(&bits, Some(8), 0.5);
        assert_eq!(decoded.text, "");
        assert_eq!(decoded.confidence, Confidence::Low);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let long = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        assert!(matches!(
            encode_payload(&long, false),
            Err(WatermarkError::InvalidInput(_)),
        ));
    }

    #[test]
    fn confidence_thresholds() {
        assert_eq!(Confidence::from_agreement(0.95), Confidence::High);
        assert_eq!(Confidence::from_agreement(0.9), Confidence::High);
        assert_eq!(Confidence::from_agreement(0.8), Confidence::Medium);
        assert_eq!(Confidence::from_agreement(0.69), Confidence::Low);
    }

    #[test]
    fn utf8_multibyte_round_trips() {
        let bits = encode_payload("héllo", true).unwrap();
        let decoded = decode_payload(&bits, None, 1.0);
        assert_eq!(decoded.text, "héllo");
    }
}

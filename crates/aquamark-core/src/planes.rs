// crates/aquamark-core/src/planes.rs
//
// Packed YUV420P frame buffers and carrier selection.
//
// Layout convention for packed YUV420P byte vecs:
//   [0 .. w*h]                        — Y plane, packed (no stride)
//   [w*h .. w*h + uv_w*uv_h]          — U plane, packed
//   [w*h + uv_w*uv_h .. end]          — V plane, packed
//
// "Packed" means strides are removed — each row is exactly w (or uv_w) bytes.
// The media crate strips ffmpeg row padding on the way in and restores it on
// the way out, so everything in this crate indexes rows as `row * width`.
//
// Chroma planes are subsampled 2:1 on both axes, so block capacity is always
// computed per plane from that plane's own dimensions.

use serde::{Deserialize, Serialize};

use crate::dct::BLOCK;
use crate::error::WatermarkError;

/// Which planes carry payload bits. A closed enumeration resolved at job
/// creation — not an extension point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Carrier {
    /// Y plane only (default). Luminance masking hides the change best.
    Luma,
    /// Y, U and V planes. More capacity, more visible chroma shift.
    LumaChroma,
}

impl Default for Carrier {
    fn default() -> Self {
        Carrier::Luma
    }
}

impl Carrier {
    /// Plane indices in fixed visiting order (channel-major).
    pub fn planes(self) -> &'static [usize] {
        match self {
            Carrier::Luma => &[0],
            Carrier::LumaChroma => &[0, 1, 2],
        }
    }
}

/// One decoded frame as packed, stride-free YUV420P planes.
pub struct PlaneSet {
    data: Vec<u8>,
    w: usize,
    h: usize,
}

impl PlaneSet {
    /// Chroma plane dimensions for a luma plane of `w`×`h`.
    pub fn chroma_dims(w: usize, h: usize) -> (usize, usize) {
        (w.div_ceil(2), h.div_ceil(2))
    }

    /// Total packed byte length for a `w`×`h` frame.
    pub fn packed_len(w: usize, h: usize) -> usize {
        let (uv_w, uv_h) = Self::chroma_dims(w, h);
        w * h + 2 * uv_w * uv_h
    }

    /// Wrap an already-packed Y ++ U ++ V buffer.
    pub fn from_packed(data: Vec<u8>, w: usize, h: usize) -> Result<Self, WatermarkError> {
        let expect = Self::packed_len(w, h);
        if data.len() != expect {
            return Err(WatermarkError::Internal(format!(
                "packed frame is {} bytes, expected {expect} for {w}x{h}",
                data.len(),
            )));
        }
        Ok(PlaneSet { data, w, h })
    }

    /// A mid-grey frame, mostly useful in tests.
    pub fn filled(w: usize, h: usize, luma: u8) -> Self {
        let mut data = vec![128u8; Self::packed_len(w, h)];
        data[..w * h].fill(luma);
        PlaneSet { data, w, h }
    }

    pub fn width(&self) -> usize {
        self.w
    }

    pub fn height(&self) -> usize {
        self.h
    }

    /// (width, height) of plane `idx` (0 = Y, 1 = U, 2 = V).
    pub fn plane_dims(&self, idx: usize) -> (usize, usize) {
        if idx == 0 {
            (self.w, self.h)
        } else {
            Self::chroma_dims(self.w, self.h)
        }
    }

    fn plane_range(&self, idx: usize) -> std::ops::Range<usize> {
        let (uv_w, uv_h) = Self::chroma_dims(self.w, self.h);
        let y_len = self.w * self.h;
        let uv_len = uv_w * uv_h;
        match idx {
            0 => 0..y_len,
            1 => y_len..y_len + uv_len,
            2 => y_len + uv_len..y_len + 2 * uv_len,
            _ => unreachable!("plane index out of range"),
        }
    }

    pub fn plane(&self, idx: usize) -> &[u8] {
        &self.data[self.plane_range(idx)]
    }

    pub fn plane_mut(&mut self, idx: usize) -> &mut [u8] {
        let range = self.plane_range(idx);
        &mut self.data[range]
    }

    pub fn as_packed(&self) -> &[u8] {
        &self.data
    }

    pub fn into_packed(self) -> Vec<u8> {
        self.data
    }

    /// Whole 8×8 blocks available in plane `idx`; partial rightmost/bottom
    /// blocks are discarded.
    pub fn plane_blocks(&self, idx: usize) -> usize {
        let (w, h) = self.plane_dims(idx);
        (w / BLOCK) * (h / BLOCK)
    }

    /// Total block capacity across the chosen carrier planes.
    pub fn block_capacity(&self, carrier: Carrier) -> usize {
        carrier.planes().iter().map(|&p| self.plane_blocks(p)).sum()
    }
}

/// Block capacity for a frame of the given luma dimensions, without
/// allocating. Used to fail `capacity_insufficient` before decoding starts.
pub fn capacity_for(w: usize, h: usize, carrier: Carrier) -> usize {
    let (uv_w, uv_h) = PlaneSet::chroma_dims(w, h);
    let luma = (w / BLOCK) * (h / BLOCK);
    match carrier {
        Carrier::Luma => luma,
        Carrier::LumaChroma => luma + 2 * (uv_w / BLOCK) * (uv_h / BLOCK),
    }
}

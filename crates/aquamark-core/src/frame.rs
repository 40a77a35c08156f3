// crates/aquamark-core/src/frame.rs
//
// Frame-level embed/extract: walk the carrier planes' 8×8 blocks in fixed
// raster order (channel-major), tiling the payload bit stream R times so each
// logical bit lands in R well-separated blocks. Extraction mirrors the walk
// and feeds per-bit majority-vote accumulators that persist across frames.
//
// The bit stream is tiled, NOT interleaved: block i carries bits[i mod N].
// With raster visiting this places the R copies of a bit a full payload
// length apart, so a localized distortion (a logo, a scene cut artifact)
// cannot take out every copy of the same bit.

use rayon::prelude::*;

use crate::dct::{strength_scale, BlockDct, BLOCK};
use crate::error::WatermarkError;
use crate::planes::{Carrier, PlaneSet};

/// Votes needed per bit before extraction may stop early.
pub const CONFIDENT_VOTES: u32 = 9;
/// Mean agreement needed before extraction may stop early.
pub const CONFIDENT_AGREEMENT: f64 = 0.9;

/// Per-bit (zeros, ones) vote accumulators. Created once per extract job and
/// carried across frames; the decision is the running majority.
#[derive(Clone, Debug)]
pub struct BitVotes {
    zeros: Vec<u32>,
    ones: Vec<u32>,
}

impl BitVotes {
    pub fn new(n_bits: usize) -> Self {
        BitVotes { zeros: vec![0; n_bits], ones: vec![0; n_bits] }
    }

    pub fn len(&self) -> usize {
        self.zeros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zeros.is_empty()
    }

    pub fn record(&mut self, bit_index: usize, bit: u8) {
        if bit == 1 {
            self.ones[bit_index] += 1;
        } else {
            self.zeros[bit_index] += 1;
        }
    }

    /// Majority decision for one bit; ties resolve to 0.
    pub fn bit(&self, bit_index: usize) -> u8 {
        u8::from(self.ones[bit_index] > self.zeros[bit_index])
    }

    pub fn bits(&self) -> Vec<u8> {
        (0..self.len()).map(|j| self.bit(j)).collect()
    }

    /// Mean per-bit agreement ratio (majority count over total votes).
    /// Bits with no votes contribute zero.
    pub fn agreement(&self) -> f64 {
        self.agreement_over(self.len())
    }

    /// Mean agreement over the first `prefix` bits only. Sentinel-mode
    /// extraction scores just the payload-plus-sentinel window, not the
    /// unvoted tail of the maximum-width accumulator.
    pub fn agreement_over(&self, prefix: usize) -> f64 {
        let n = prefix.min(self.len());
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = (0..n)
            .map(|j| {
                let total = self.zeros[j] + self.ones[j];
                if total == 0 {
                    0.0
                } else {
                    f64::from(self.zeros[j].max(self.ones[j])) / f64::from(total)
                }
            })
            .sum();
        sum / n as f64
    }

    /// Fewest votes any single bit has received so far.
    pub fn min_votes(&self) -> u32 {
        self.min_votes_over(self.len())
    }

    pub fn min_votes_over(&self, prefix: usize) -> u32 {
        let n = prefix.min(self.len());
        (0..n).map(|j| self.zeros[j] + self.ones[j]).min().unwrap_or(0)
    }

    /// True once every bit has enough votes and the vote is one-sided enough
    /// that further frames cannot realistically change the outcome.
    pub fn settled(&self) -> bool {
        self.settled_over(self.len())
    }

    pub fn settled_over(&self, prefix: usize) -> bool {
        prefix > 0
            && !self.is_empty()
            && self.min_votes_over(prefix) >= CONFIDENT_VOTES
            && self.agreement_over(prefix) >= CONFIDENT_AGREEMENT
    }
}

/// Embeds and extracts bit streams on packed YUV420P frames.
pub struct FrameWatermarker {
    dct: BlockDct,
}

impl FrameWatermarker {
    pub fn new() -> Self {
        FrameWatermarker { dct: BlockDct::new() }
    }

    /// Embed `bits` into `planes`, tiled `redundancy` times across the
    /// carrier planes' blocks. A zero-length bit stream is a no-op.
    ///
    /// Fails with `CapacityInsufficient` before touching any block when the
    /// carriers cannot hold `redundancy * bits.len()` blocks.
    pub fn embed(
        &self,
        planes: &mut PlaneSet,
        payload: &[u8],
        carrier: Carrier,
        strength: f32,
        redundancy: usize,
    ) -> Result<(), WatermarkError> {
        let n = payload.len();
        if n == 0 {
            return Ok(());
        }

        let needed = n * redundancy;
        let capacity = planes.block_capacity(carrier);
        if needed > capacity {
            return Err(WatermarkError::CapacityInsufficient { needed, capacity });
        }

        let q = strength_scale(strength);
        let mut offset = 0usize;
        for &plane_idx in carrier.planes() {
            let (pw, ph) = planes.plane_dims(plane_idx);
            let plane_blocks = planes.plane_blocks(plane_idx);
            if offset >= needed {
                break;
            }
            self.embed_plane(planes.plane_mut(plane_idx), pw, ph, offset, needed, payload, q);
            offset += plane_blocks;
        }
        Ok(())
    }

    /// Embed into one packed plane. Block index `offset + by*bw + bx` selects
    /// the payload bit; blocks at or past `needed` are left untouched.
    ///
    /// Bands of 8 rows are independent, so the walk runs per band in
    /// parallel; the output is byte-identical to the sequential order.
    fn embed_plane(
        &self,
        plane: &mut [u8],
        pw: usize,
        ph: usize,
        offset: usize,
        needed: usize,
        payload: &[u8],
        q: f32,
    ) {
        let bw = pw / BLOCK;
        let bh = ph / BLOCK;
        if bw == 0 || bh == 0 {
            return;
        }
        let n = payload.len();
        let dct = &self.dct;

        plane
            .par_chunks_mut(pw * BLOCK)
            .take(bh)
            .enumerate()
            .for_each(|(by, band)| {
                let mut block = [0.0f32; BLOCK * BLOCK];
                for bx in 0..bw {
                    let i = offset + by * bw + bx;
                    if i >= needed {
                        return;
                    }
                    gather_block(band, pw, bx, &mut block);
                    dct.embed_bit(&mut block, payload[i % n], q);
                    scatter_block(band, pw, bx, &block);
                }
            });
    }

    /// Extract one frame's worth of votes into `votes` (one accumulator set
    /// per logical bit, carried across frames by the caller).
    pub fn extract(
        &self,
        planes: &PlaneSet,
        votes: &mut BitVotes,
        carrier: Carrier,
        strength: f32,
        redundancy: usize,
    ) {
        let n = votes.len();
        if n == 0 {
            return;
        }
        let q = strength_scale(strength);
        let slots = (n * redundancy).min(planes.block_capacity(carrier));

        let mut block = [0.0f32; BLOCK * BLOCK];
        let mut i = 0usize;
        for &plane_idx in carrier.planes() {
            let (pw, ph) = planes.plane_dims(plane_idx);
            let bw = pw / BLOCK;
            let bh = ph / BLOCK;
            let plane = planes.plane(plane_idx);
            for by in 0..bh {
                let band = &plane[by * pw * BLOCK..(by + 1) * pw * BLOCK];
                for bx in 0..bw {
                    if i >= slots {
                        return;
                    }
                    gather_block(band, pw, bx, &mut block);
                    votes.record(i % n, self.dct.extract_bit(&block, q));
                    i += 1;
                }
            }
        }
    }
}

impl Default for FrameWatermarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy one 8×8 block out of an 8-row band, centering samples around 0.
fn gather_block(band: &[u8], pw: usize, bx: usize, block: &mut [f32; BLOCK * BLOCK]) {
    for r in 0..BLOCK {
        let row = &band[r * pw + bx * BLOCK..r * pw + bx * BLOCK + BLOCK];
        for (c, &v) in row.iter().enumerate() {
            block[r * BLOCK + c] = f32::from(v) - 128.0;
        }
    }
}

/// Write a centered block back into its band, rounded and clamped to [0,255].
fn scatter_block(band: &mut [u8], pw: usize, bx: usize, block: &[f32; BLOCK * BLOCK]) {
    for r in 0..BLOCK {
        let row = &mut band[r * pw + bx * BLOCK..r * pw + bx * BLOCK + BLOCK];
        for (c, slot) in row.iter_mut().enumerate() {
            *slot = (block[r * BLOCK + c] + 128.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Convenience for single-shot extraction when the whole stream fits one
/// frame: returns the majority bits and their mean agreement.
pub fn extract_single_frame(
    watermarker: &FrameWatermarker,
    planes: &PlaneSet,
    n_bits: usize,
    carrier: Carrier,
    strength: f32,
    redundancy: usize,
) -> (Vec<u8>, f64) {
    let mut votes = BitVotes::new(n_bits);
    watermarker.extract(planes, &mut votes, carrier, strength, redundancy);
    (votes.bits(), votes.agreement())
}

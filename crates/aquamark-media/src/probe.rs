// crates/aquamark-media/src/probe.rs
//
// Layered input validation: filesystem checks, container signature, ffmpeg
// decode probe, sanity warnings. Each layer only runs when the previous one
// left something to probe; the report accumulates everything it learned.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type;

/// Containers accepted for input.
pub const SUPPORTED_CONTAINERS: [&str; 7] = ["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"];

/// How many packets the decode probe will feed before concluding the video
/// stream is not decodable.
const PROBE_PACKET_LIMIT: usize = 256;

/// Structured result of validating one input path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub exists: bool,
    pub readable: bool,
    pub has_video_stream: bool,
    pub has_audio_stream: bool,
    pub duration_s: Option<f64>,
    pub frame_count: Option<u64>,
    pub fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codec_tag: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// A submittable input: no hard errors and a decodable video stream.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.has_video_stream
    }

    /// True when enough metadata is present for a confident time estimate.
    pub fn metadata_complete(&self) -> bool {
        self.frame_count.is_some() && self.width.is_some() && self.height.is_some()
    }
}

/// Recognize a container family from its opening bytes.
fn sniff_container(header: &[u8]) -> Option<&'static str> {
    if header.len() < 12 {
        return None;
    }
    if &header[4..8] == b"ftyp" {
        return Some("mp4/mov");
    }
    if &header[..4] == b"RIFF" && &header[8..12] == b"AVI " {
        return Some("avi");
    }
    // EBML — both Matroska and WebM; the DocType distinguishes them but the
    // allow-list accepts either.
    if header[..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return Some("mkv/webm");
    }
    // ASF header object GUID (WMV).
    if header[..8] == [0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11] {
        return Some("wmv");
    }
    if &header[..3] == b"FLV" {
        return Some("flv");
    }
    None
}

/// Validate `path` as a watermarking input.
pub fn validate(path: &Path, max_file_size: u64) -> ValidationReport {
    let mut report = ValidationReport::default();

    // ── Layer 1: path & size ──────────────────────────────────────────────────
    let size = match std::fs::metadata(path) {
        Ok(meta) => {
            report.exists = true;
            meta.len()
        }
        Err(_) => {
            report.errors.push(format!("file does not exist: {}", path.display()));
            return report;
        }
    };

    let mut header = [0u8; 16];
    let header_len = match File::open(path).and_then(|mut f| f.read(&mut header)) {
        Ok(n) => {
            report.readable = true;
            n
        }
        Err(e) => {
            report.errors.push(format!("file is not readable: {e}"));
            return report;
        }
    };

    if size == 0 {
        report.errors.push("file is empty".into());
        return report;
    }
    if size > max_file_size {
        report.errors.push(format!("file is {size} bytes, maximum is {max_file_size}"));
        return report;
    }

    // ── Layer 2: container signature ──────────────────────────────────────────
    match sniff_container(&header[..header_len]) {
        Some(container) => debug!(target: "probe", container, path = %path.display(), "signature ok"),
        None => {
            report.errors.push(format!(
                "unrecognized container signature (supported: {})",
                SUPPORTED_CONTAINERS.join(", "),
            ));
            return report;
        }
    }

    // ── Layer 3: decoder probe ────────────────────────────────────────────────
    if let Err(e) = probe_streams(path, &mut report) {
        report.errors.push(format!("decode probe failed: {e}"));
    }

    // ── Layer 4: sanity warnings ──────────────────────────────────────────────
    if let Some(fps) = report.fps {
        if !(1.0..=120.0).contains(&fps) {
            report.warnings.push(format!("unusual frame rate: {fps:.2} fps"));
        }
    }
    if let Some(dur) = report.duration_s {
        if dur > 3600.0 {
            report.warnings.push(format!("long video: {:.0} minutes", dur / 60.0));
        }
    }
    if let (Some(w), Some(h)) = (report.width, report.height) {
        if w < 64 || h < 64 {
            report.warnings.push(format!("small dimensions: {w}x{h} leaves little block capacity"));
        }
        if w % 2 == 1 || h % 2 == 1 {
            report.warnings.push(format!("odd dimensions: {w}x{h} loses edge blocks to alignment"));
        }
    }
    if report.has_audio_stream {
        report.warnings.push("audio stream will not be carried into the output".into());
    }

    report
}

/// Open the container, read stream metadata, and require at least one
/// decodable video frame.
fn probe_streams(path: &Path, report: &mut ValidationReport) -> Result<()> {
    ffmpeg::init().context("ffmpeg init")?;

    let path = path.to_path_buf();
    let ictx = ffmpeg::format::input(&path).context("open container")?;

    report.has_audio_stream = ictx.streams().best(Type::Audio).is_some();

    let Some(stream) = ictx.streams().best(Type::Video) else {
        return Err(anyhow!("no video stream"));
    };
    let video_idx = stream.index();

    let rate = stream.avg_frame_rate();
    if rate.numerator() > 0 && rate.denominator() > 0 {
        report.fps = Some(f64::from(rate));
    }

    let (w, h, codec_tag) = unsafe {
        let p = stream.parameters().as_ptr();
        ((*p).width as u32, (*p).height as u32, (*p).codec_tag)
    };
    if w > 0 && h > 0 {
        report.width = Some(w);
        report.height = Some(h);
    }
    report.codec_tag = Some(fourcc_or_id(codec_tag, stream.parameters().id()));

    // Container duration, falling back to the stream's own timebase duration.
    let dur = ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
    if dur > 0.0 {
        report.duration_s = Some(dur);
    } else {
        let tb = stream.time_base();
        let d = stream.duration() as f64 * f64::from(tb);
        if d > 0.0 {
            report.duration_s = Some(d);
        }
    }

    let declared_frames = stream.frames();
    if declared_frames > 0 {
        report.frame_count = Some(declared_frames as u64);
    } else if let (Some(dur), Some(fps)) = (report.duration_s, report.fps) {
        report.frame_count = Some((dur * fps).round() as u64);
    }

    // A second context drives the trial decode — Parameters borrows from the
    // first one's streams.
    let mut ictx2 = ffmpeg::format::input(&path).context("reopen for decode probe")?;
    let dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("decoder parameters")?;
    let mut decoder = dec_ctx.decoder().video().context("open video decoder")?;

    let mut fed = 0usize;
    let mut decoded = ffmpeg::util::frame::video::Video::empty();
    for result in ictx2.packets() {
        let (pstream, packet) = result.context("read packet")?;
        if pstream.index() != video_idx {
            continue;
        }
        fed += 1;
        if decoder.send_packet(&packet).is_err() {
            if fed >= PROBE_PACKET_LIMIT {
                break;
            }
            continue;
        }
        if decoder.receive_frame(&mut decoded).is_ok() {
            report.has_video_stream = true;
            return Ok(());
        }
        if fed >= PROBE_PACKET_LIMIT {
            break;
        }
    }
    // Flush: short streams may hold their only frames in the decoder.
    let _ = decoder.send_eof();
    if decoder.receive_frame(&mut decoded).is_ok() {
        report.has_video_stream = true;
        return Ok(());
    }

    Err(anyhow!("no decodable video frames"))
}

/// Render a fourcc when the container carries one, else the codec id.
fn fourcc_or_id(tag: u32, id: ffmpeg::codec::Id) -> String {
    if tag != 0 {
        let bytes = tag.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return bytes.iter().map(|&b| b as char).collect();
        }
    }
    format!("{id:?}").to_lowercase()
}

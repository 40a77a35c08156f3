// crates/aquamark-media/src/pipeline.rs
//
// Frame-by-frame watermark pipelines.
//
// Embed:
//   open input → pick output codec → decode → scale to YUV420P → watermark
//   the packed planes → write back → encode → mux. Progress is reported every
//   `progress_interval` frames and once at exactly 100%. On any error the
//   partially written output is deleted before returning.
//
// Extract:
//   decode a bounded prefix of frames, scale to YUV420P, and feed each
//   frame's blocks into the persistent majority-vote accumulators. Stops
//   early once every bit in the decoded window is confidently settled.
//
// Output codec rule: an H.264 input stays H.264 (crf 18, preset fast); an
// MPEG-4 Part 2 input stays mp4v; everything else falls back to mp4v. The
// container is always MP4.
//
// PTS strategy: a monotonically increasing frame counter in 1/fps, reset to
// zero at the start of the output — source timestamps never leak through.
//
// Audio is not carried: the validator warned about it at submit time, and a
// watermark-only re-mux cannot preserve A/V sync guarantees once frames are
// re-encoded with different GOP structure.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::{input as open_input, output as open_output, Pixel};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::scaling::{Context as ScaleCtx, Flags as ScaleFlags};
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use aquamark_core::bits::{self, DecodedPayload};
use aquamark_core::frame::{BitVotes, FrameWatermarker};
use aquamark_core::options::{EmbedOptions, ExtractOptions};
use aquamark_core::planes::{capacity_for, PlaneSet};
use aquamark_core::progress::ProgressSink;
use aquamark_core::{WatermarkError, MAX_PAYLOAD_BYTES};

/// Result of scanning a video for an embedded payload.
#[derive(Clone, Debug)]
pub struct ExtractOutcome {
    pub decoded: DecodedPayload,
    pub frames_scanned: u64,
}

/// Embed `payload_bits` into every frame of `input`, writing `output`.
/// Returns the number of frames written. Deletes `output` on every error
/// path, including stop-flag aborts.
pub fn embed_video(
    input: &Path,
    output: &Path,
    payload_bits: &[u8],
    opts: &EmbedOptions,
    progress_interval: u64,
    sink: &dyn ProgressSink,
    stop: &AtomicBool,
) -> Result<u64, WatermarkError> {
    let result = run_embed(input, output, payload_bits, opts, progress_interval, sink, stop);
    if result.is_err() {
        let _ = std::fs::remove_file(output);
    }
    result
}

fn run_embed(
    input: &Path,
    output: &Path,
    payload_bits: &[u8],
    opts: &EmbedOptions,
    progress_interval: u64,
    sink: &dyn ProgressSink,
    stop: &AtomicBool,
) -> Result<u64, WatermarkError> {
    ffmpeg::init().map_err(|e| WatermarkError::Internal(format!("ffmpeg init: {e}")))?;

    let input = input.to_path_buf();
    let output = output.to_path_buf();

    // ── Input side ────────────────────────────────────────────────────────────
    let mut ictx = open_input(&input)
        .map_err(|e| WatermarkError::DecoderError(format!("open '{}': {e}", input.display())))?;

    let video_idx = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or_else(|| WatermarkError::DecoderError(format!("no video stream in '{}'", input.display())))?
        .index();

    let (in_codec_id, rate, total_frames) = {
        let stream = ictx.stream(video_idx).ok_or_else(|| {
            WatermarkError::Internal("video stream index vanished".into())
        })?;
        let r = stream.avg_frame_rate();
        let rate = if r.numerator() > 0 && r.denominator() > 0 { r } else { Rational::new(25, 1) };
        let declared = stream.frames();
        let total = if declared > 0 {
            Some(declared as u64)
        } else {
            let tb = stream.time_base();
            let dur = stream.duration() as f64 * f64::from(tb);
            (dur > 0.0).then(|| (dur * f64::from(rate)).round() as u64)
        };
        (stream.parameters().id(), rate, total)
    };

    let dec_ctx = codec::context::Context::from_parameters(
        ictx.stream(video_idx).unwrap().parameters(),
    )
    .map_err(|e| WatermarkError::DecoderError(format!("decoder context: {e}")))?;
    let mut decoder = dec_ctx
        .decoder()
        .video()
        .map_err(|e| WatermarkError::DecoderError(format!("open video decoder: {e}")))?;

    let (w, h) = (decoder.width(), decoder.height());
    if w == 0 || h == 0 {
        return Err(WatermarkError::DecoderError("input has zero dimensions".into()));
    }

    // Fail before the output file exists when the payload cannot fit.
    let needed = payload_bits.len() * opts.redundancy;
    let capacity = capacity_for(w as usize, h as usize, opts.carrier);
    if needed > capacity {
        return Err(WatermarkError::CapacityInsufficient { needed, capacity });
    }

    // ── Output side ───────────────────────────────────────────────────────────
    let out_id = match in_codec_id {
        CodecId::H264 => CodecId::H264,
        CodecId::MPEG4 => CodecId::MPEG4,
        _ => CodecId::MPEG4,
    };
    // Fall back to mp4v when the preferred encoder is not built in.
    let (out_id, vcodec) = match encoder::find(out_id) {
        Some(c) => (out_id, c),
        None => (
            CodecId::MPEG4,
            encoder::find(CodecId::MPEG4)
                .ok_or_else(|| WatermarkError::Internal("no MPEG-4 encoder available".into()))?,
        ),
    };
    info!(target: "pipeline", codec = ?out_id, w, h, fps = f64::from(rate), "embed start");

    let mut octx = open_output(&output)
        .map_err(|e| WatermarkError::Internal(format!("open output '{}': {e}", output.display())))?;

    let out_tb = Rational::new(rate.denominator(), rate.numerator());
    let mut ost = octx
        .add_stream(vcodec)
        .map_err(|e| WatermarkError::Internal(format!("add video stream: {e}")))?;
    ost.set_time_base(out_tb);

    let enc_ctx = codec::context::Context::new_with_codec(vcodec);
    let mut venc = enc_ctx
        .encoder()
        .video()
        .map_err(|e| WatermarkError::Internal(format!("create video encoder: {e}")))?;

    venc.set_width(w);
    venc.set_height(h);
    venc.set_format(Pixel::YUV420P);
    venc.set_time_base(out_tb);
    venc.set_frame_rate(Some(rate));

    let mut enc_opts = ffmpeg::Dictionary::new();
    match out_id {
        CodecId::H264 => {
            venc.set_bit_rate(0); // CRF controls quality; bit_rate 0 signals VBR
            enc_opts.set("crf", "18");
            enc_opts.set("preset", "fast");
        }
        _ => {
            // mp4v has no CRF mode; scale the bitrate with the pixel rate.
            venc.set_bit_rate((w as usize * h as usize * 4).max(1_000_000));
        }
    }

    let mut video_encoder = venc
        .open_as_with(vcodec, enc_opts)
        .map_err(|e| WatermarkError::Internal(format!("open {out_id:?} encoder: {e}")))?;

    // Copy encoder params into the stream's codecpar so the muxer has
    // resolution, format, and codec-private data. set_parameters() requires
    // AsPtr<AVCodecParameters>, which encoder::Video does not implement.
    unsafe {
        let ret = ffmpeg::ffi::avcodec_parameters_from_context(
            (**(*octx.as_mut_ptr()).streams.add(0)).codecpar,
            video_encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
        );
        if ret < 0 {
            return Err(WatermarkError::Internal(format!(
                "avcodec_parameters_from_context failed: {ret}",
            )));
        }
    }

    octx.write_header()
        .map_err(|e| WatermarkError::Internal(format!("write output header: {e}")))?;
    let ost_tb = octx.stream(0).unwrap().time_base();

    // Scaler normalizes any input pixel format to YUV420P at source size.
    let mut scaler = ScaleCtx::get(
        decoder.format(),
        w,
        h,
        Pixel::YUV420P,
        w,
        h,
        ScaleFlags::BILINEAR,
    )
    .map_err(|e| WatermarkError::Internal(format!("create scaler: {e}")))?;

    let watermarker = FrameWatermarker::new();
    let mut frame_idx: i64 = 0;

    // ── Packet loop ───────────────────────────────────────────────────────────
    for result in ictx.packets() {
        let (stream, packet) =
            result.map_err(|e| WatermarkError::DecoderError(format!("read packet: {e}")))?;
        if stream.index() != video_idx {
            continue; // audio and data streams are dropped
        }
        if stop.load(Ordering::Relaxed) {
            return Err(WatermarkError::Shutdown);
        }
        // A corrupt packet is skipped; an unrecoverable stream surfaces as a
        // read error above.
        if decoder.send_packet(&packet).is_err() {
            continue;
        }

        let mut decoded = VideoFrame::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            frame_idx = mark_and_mux(
                &decoded,
                &mut scaler,
                &watermarker,
                payload_bits,
                opts,
                frame_idx,
                &mut video_encoder,
                &mut octx,
                out_tb,
                ost_tb,
            )?;

            if progress_interval > 0 && frame_idx as u64 % progress_interval == 0 {
                sink.progress(
                    percent_of(frame_idx as u64, total_frames),
                    &format!("frame {frame_idx}"),
                );
            }
        }
    }

    // ── Drain the decoder (B-frame codecs hold frames internally) ─────────────
    let _ = decoder.send_eof();
    let mut decoded = VideoFrame::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        frame_idx = mark_and_mux(
            &decoded,
            &mut scaler,
            &watermarker,
            payload_bits,
            opts,
            frame_idx,
            &mut video_encoder,
            &mut octx,
            out_tb,
            ost_tb,
        )?;
    }

    if frame_idx == 0 {
        return Err(WatermarkError::DecoderError("no decodable video frames".into()));
    }

    // ── Flush the encoder and close ───────────────────────────────────────────
    video_encoder
        .send_eof()
        .map_err(|e| WatermarkError::Internal(format!("send EOF to encoder: {e}")))?;
    let mut pkt = Packet::empty();
    while video_encoder.receive_packet(&mut pkt).is_ok() {
        pkt.set_stream(0);
        pkt.rescale_ts(out_tb, ost_tb);
        pkt.write_interleaved(&mut octx)
            .map_err(|e| WatermarkError::Internal(format!("write flush packet: {e}")))?;
    }

    octx.write_trailer()
        .map_err(|e| WatermarkError::Internal(format!("write trailer: {e}")))?;

    sink.progress(100.0, &format!("{frame_idx} frames watermarked"));
    info!(target: "pipeline", frames = frame_idx, output = %output.display(), "embed done");
    Ok(frame_idx as u64)
}

/// Watermark one decoded frame and push it through the encoder.
/// Returns the next frame index.
#[allow(clippy::too_many_arguments)]
fn mark_and_mux(
    decoded: &VideoFrame,
    scaler: &mut ScaleCtx,
    watermarker: &FrameWatermarker,
    payload_bits: &[u8],
    opts: &EmbedOptions,
    frame_idx: i64,
    video_encoder: &mut ffmpeg::encoder::video::Video,
    octx: &mut ffmpeg::format::context::Output,
    out_tb: Rational,
    ost_tb: Rational,
) -> Result<i64, WatermarkError> {
    let frame_err = |reason: String| WatermarkError::FrameProcessingFailed {
        frame: frame_idx as u64,
        reason,
    };

    let mut yuv = VideoFrame::empty();
    scaler.run(decoded, &mut yuv).map_err(|e| frame_err(format!("scale: {e}")))?;

    let w = yuv.width() as usize;
    let h = yuv.height() as usize;
    let mut planes = packed_planes(&yuv, w, h)?;
    watermarker
        .embed(&mut planes, payload_bits, opts.carrier, opts.strength, opts.redundancy)
        .map_err(|e| match e {
            // Capacity was pre-checked against the stream dimensions; a
            // mid-stream resolution change lands here.
            WatermarkError::CapacityInsufficient { .. } => e,
            other => frame_err(other.to_string()),
        })?;
    store_planes(&planes, &mut yuv);

    yuv.set_pts(Some(frame_idx));
    video_encoder
        .send_frame(&yuv)
        .map_err(|e| frame_err(format!("send frame to encoder: {e}")))?;

    let mut pkt = Packet::empty();
    while video_encoder.receive_packet(&mut pkt).is_ok() {
        pkt.set_stream(0);
        pkt.rescale_ts(out_tb, ost_tb);
        pkt.write_interleaved(octx).map_err(|e| frame_err(format!("write packet: {e}")))?;
    }

    Ok(frame_idx + 1)
}

/// Scan a bounded prefix of `input` for an embedded payload.
pub fn extract_video(
    input: &Path,
    opts: &ExtractOptions,
    sink: &dyn ProgressSink,
    stop: &AtomicBool,
) -> Result<ExtractOutcome, WatermarkError> {
    ffmpeg::init().map_err(|e| WatermarkError::Internal(format!("ffmpeg init: {e}")))?;

    let n_bits = match opts.expected_bytes {
        Some(0) => {
            // Zero-length request: nothing to vote on.
            return Ok(ExtractOutcome {
                decoded: bits::decode_payload(&[], Some(0), 0.0),
                frames_scanned: 0,
            });
        }
        Some(n) => n * 8,
        // Unknown length: vote on the widest possible window (payload cap
        // plus sentinel) and truncate at the sentinel afterwards.
        None => bits::payload_bits(MAX_PAYLOAD_BYTES, true),
    };

    let input = input.to_path_buf();
    let mut ictx = open_input(&input)
        .map_err(|e| WatermarkError::DecoderError(format!("open '{}': {e}", input.display())))?;

    let video_idx = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or_else(|| WatermarkError::DecoderError(format!("no video stream in '{}'", input.display())))?
        .index();

    let dec_ctx = codec::context::Context::from_parameters(
        ictx.stream(video_idx).unwrap().parameters(),
    )
    .map_err(|e| WatermarkError::DecoderError(format!("decoder context: {e}")))?;
    let mut decoder = dec_ctx
        .decoder()
        .video()
        .map_err(|e| WatermarkError::DecoderError(format!("open video decoder: {e}")))?;

    let (w, h) = (decoder.width() as usize, decoder.height() as usize);
    let mut scaler = ScaleCtx::get(
        decoder.format(),
        w as u32,
        h as u32,
        Pixel::YUV420P,
        w as u32,
        h as u32,
        ScaleFlags::BILINEAR,
    )
    .map_err(|e| WatermarkError::Internal(format!("create scaler: {e}")))?;

    let watermarker = FrameWatermarker::new();
    let mut votes = BitVotes::new(n_bits);
    let mut frames: u64 = 0;

    'read: for result in ictx.packets() {
        let (stream, packet) =
            result.map_err(|e| WatermarkError::DecoderError(format!("read packet: {e}")))?;
        if stream.index() != video_idx {
            continue;
        }
        if stop.load(Ordering::Relaxed) {
            return Err(WatermarkError::Shutdown);
        }
        if decoder.send_packet(&packet).is_err() {
            continue;
        }

        let mut decoded = VideoFrame::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            let mut yuv = VideoFrame::empty();
            scaler.run(&decoded, &mut yuv).map_err(|e| WatermarkError::FrameProcessingFailed {
                frame: frames,
                reason: format!("scale: {e}"),
            })?;
            let planes = packed_planes(&yuv, w, h)?;
            watermarker.extract(&planes, &mut votes, opts.carrier, opts.strength, opts.redundancy);
            frames += 1;

            sink.progress(
                (frames as f32 / opts.max_frames as f32 * 100.0).min(99.0),
                &format!("scanned frame {frames}"),
            );

            if frames >= opts.max_frames || settled(&votes, opts.expected_bytes) {
                break 'read;
            }
        }
    }

    if frames == 0 {
        return Err(WatermarkError::DecoderError("no decodable video frames".into()));
    }

    let estimate = votes.bits();
    let decoded = match opts.expected_bytes {
        Some(n) => {
            let agreement = votes.agreement_over(n * 8);
            bits::decode_payload(&estimate, Some(n), agreement)
        }
        None => match bits::sentinel_offset(&estimate) {
            Some(offset) => {
                let agreement = votes.agreement_over(offset + 16);
                bits::decode_payload(&estimate[..offset + 16], None, agreement)
            }
            None => bits::decode_payload(&[], Some(0), 0.0),
        },
    };

    sink.progress(100.0, &format!("scanned {frames} frames"));
    debug!(target: "pipeline", frames, confidence = ?decoded.confidence, "extract done");
    Ok(ExtractOutcome { decoded, frames_scanned: frames })
}

/// Early-termination check: every bit in the decision window has enough
/// one-sided votes. For sentinel-mode extraction the window is only known
/// once the sentinel shows up in the running majority.
fn settled(votes: &BitVotes, expected_bytes: Option<usize>) -> bool {
    match expected_bytes {
        Some(n) => votes.settled_over(n * 8),
        None => match bits::sentinel_offset(&votes.bits()) {
            Some(offset) => votes.settled_over(offset + 16),
            None => false,
        },
    }
}

fn percent_of(frame: u64, total: Option<u64>) -> f32 {
    match total {
        // Intermediate updates stay below 100 — the final event owns it.
        Some(t) if t > 0 => ((frame as f32 / t as f32) * 100.0).min(99.0),
        _ => 0.0,
    }
}

/// Copy a scaled YUV420P frame into a packed, stride-free `PlaneSet`.
fn packed_planes(yuv: &VideoFrame, w: usize, h: usize) -> Result<PlaneSet, WatermarkError> {
    let (uv_w, uv_h) = PlaneSet::chroma_dims(w, h);
    let dims = [(w, h), (uv_w, uv_h), (uv_w, uv_h)];

    let mut data = vec![0u8; PlaneSet::packed_len(w, h)];
    let mut offset = 0usize;
    for (plane, &(pw, ph)) in dims.iter().enumerate() {
        let stride = yuv.stride(plane);
        let src = yuv.data(plane);
        for row in 0..ph {
            data[offset + row * pw..offset + row * pw + pw]
                .copy_from_slice(&src[row * stride..row * stride + pw]);
        }
        offset += pw * ph;
    }
    PlaneSet::from_packed(data, w, h)
}

/// Write packed planes back into a strided frame, the inverse of
/// [`packed_planes`].
fn store_planes(planes: &PlaneSet, yuv: &mut VideoFrame) {
    for plane in 0..3 {
        let (pw, ph) = planes.plane_dims(plane);
        let stride = yuv.stride(plane);
        let src = planes.plane(plane);
        let dst = yuv.data_mut(plane);
        for row in 0..ph {
            dst[row * stride..row * stride + pw].copy_from_slice(&src[row * pw..row * pw + pw]);
        }
    }
}

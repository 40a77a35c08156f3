// crates/aquamark-cli/src/main.rs
//
// Command-line front end over the watermarking core: one-shot embed and
// extract, a queue-backed batch mode, plus the probe and estimate surfaces
// the service adapter exposes remotely. Results go to stdout; logs and
// progress go to stderr.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aquamark_core::estimate;
use aquamark_core::job::JobStatus;
use aquamark_core::options::{EmbedOptions, EngineConfig, ExtractOptions};
use aquamark_core::planes::Carrier;
use aquamark_core::progress::{FnSink, ProgressSink};
use aquamark_media::{pipeline, probe, WatermarkEngine};

#[derive(Parser)]
#[command(name = "aquamark", version, about = "DCT-domain video watermarking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Embed a text payload into a video.
    Embed {
        input: PathBuf,
        /// Payload text (at most 50 bytes).
        #[arg(short, long)]
        text: String,
        /// Output path; defaults to `<input stem>.marked.mp4`.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Embedding strength in [0.05, 0.30].
        #[arg(short, long, default_value_t = 0.1)]
        strength: f32,
        /// Carry bits in the chroma planes as well as luma.
        #[arg(long)]
        multi_channel: bool,
        /// Blocks carrying each payload bit.
        #[arg(short, long, default_value_t = 3)]
        redundancy: usize,
        /// Skip the end-of-message sentinel (extraction will need --length).
        #[arg(long)]
        no_sentinel: bool,
    },
    /// Recover a payload from a watermarked video.
    Extract {
        input: PathBuf,
        /// Payload length in bytes, when known. Without it the sentinel is
        /// required.
        #[arg(short, long)]
        length: Option<usize>,
        #[arg(short, long, default_value_t = 0.1)]
        strength: f32,
        #[arg(long)]
        multi_channel: bool,
        #[arg(short, long, default_value_t = 3)]
        redundancy: usize,
        /// Most frames to scan before giving up.
        #[arg(long, default_value_t = 30)]
        max_frames: u64,
    },
    /// Watermark many videos concurrently through the job queue.
    Batch {
        /// Input videos.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Payload text embedded into every input.
        #[arg(short, long)]
        text: String,
        #[arg(short, long, default_value_t = 0.1)]
        strength: f32,
        #[arg(long)]
        multi_channel: bool,
        #[arg(short, long, default_value_t = 3)]
        redundancy: usize,
        /// Directory for finalized outputs (one `<job id>.mp4` per input).
        #[arg(short, long, default_value = "aquamark-out")]
        output_dir: PathBuf,
        /// Worker pool size; defaults to available cores, capped at 4.
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Validate an input and print its metadata report.
    Probe {
        input: PathBuf,
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Predict how long an embed would take.
    Estimate {
        input: PathBuf,
        /// Payload length in bytes.
        #[arg(short, long, default_value_t = 16)]
        payload_len: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Embed { input, text, output, strength, multi_channel, redundancy, no_sentinel } => {
            let options = EmbedOptions {
                strength,
                carrier: if multi_channel { Carrier::LumaChroma } else { Carrier::Luma },
                redundancy,
                sentinel: !no_sentinel,
            };
            options.validate()?;

            let report = probe::validate(&input, u64::MAX);
            for warning in &report.warnings {
                tracing::warn!(target: "cli", "{warning}");
            }
            if !report.is_valid() {
                bail!("invalid input: {}", report.errors.join("; "));
            }

            let output = output.unwrap_or_else(|| {
                let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "out".into());
                input.with_file_name(format!("{stem}.marked.mp4"))
            });

            let bits = aquamark_core::bits::encode_payload(&text, options.sentinel)?;
            let sink = progress_to_stderr();
            let stop = AtomicBool::new(false);
            let frames =
                pipeline::embed_video(&input, &output, &bits, &options, 10, &sink, &stop)
                    .with_context(|| format!("embedding into {}", input.display()))?;

            info!(target: "cli", frames, "embed finished");
            println!("{}", output.display());
        }

        Command::Extract { input, length, strength, multi_channel, redundancy, max_frames } => {
            let options = ExtractOptions {
                expected_bytes: length,
                strength,
                carrier: if multi_channel { Carrier::LumaChroma } else { Carrier::Luma },
                redundancy,
                max_frames,
            };
            options.validate()?;

            let sink = progress_to_stderr();
            let stop = AtomicBool::new(false);
            let outcome = pipeline::extract_video(&input, &options, &sink, &stop)
                .with_context(|| format!("extracting from {}", input.display()))?;

            info!(
                target: "cli",
                frames = outcome.frames_scanned,
                confidence = ?outcome.decoded.confidence,
                agreement = format!("{:.2}", outcome.decoded.agreement),
                "extract finished"
            );
            if outcome.decoded.text.is_empty() {
                bail!("no payload recovered (confidence {:?})", outcome.decoded.confidence);
            }
            println!("{}", outcome.decoded.text);
        }

        Command::Batch { inputs, text, strength, multi_channel, redundancy, output_dir, workers } => {
            let options = EmbedOptions {
                strength,
                carrier: if multi_channel { Carrier::LumaChroma } else { Carrier::Luma },
                redundancy,
                sentinel: true,
            };
            options.validate()?;

            let mut cfg = EngineConfig::new(output_dir.join(".work"), output_dir);
            if let Some(workers) = workers {
                cfg.workers = workers.max(1);
            }
            let engine = WatermarkEngine::new(cfg)?;

            let mut accepted = Vec::new();
            for input in &inputs {
                match engine.submit_embed(input, &text, options) {
                    Ok(id) => accepted.push((id, input.clone(), engine.subscribe(id))),
                    Err(e) => {
                        tracing::error!(target: "cli", input = %input.display(), %e, "rejected");
                    }
                }
            }
            if accepted.is_empty() {
                bail!("no inputs were accepted");
            }

            // Drain each stream in turn; jobs run concurrently regardless of
            // the order we watch them in. The table snapshot is authoritative
            // for the final verdict (intermediate events are lossy).
            let mut failures = 0usize;
            for (id, input, stream) in accepted {
                if let Some(stream) = stream {
                    for event in stream.iter() {
                        info!(
                            target: "progress",
                            input = %input.display(),
                            "{:5.1}%  {}",
                            event.progress,
                            event.message,
                        );
                    }
                }
                match engine.get_job(id) {
                    Some(snap) if snap.status == JobStatus::Completed => {
                        let output = snap
                            .result
                            .map(|r| r.output_path.display().to_string())
                            .unwrap_or_default();
                        println!("{}\t{output}", input.display());
                    }
                    Some(snap) => {
                        failures += 1;
                        tracing::error!(
                            target: "cli",
                            input = %input.display(),
                            error = snap.error.as_deref().unwrap_or("unknown"),
                            "{}", snap.message,
                        );
                    }
                    None => failures += 1,
                }
            }

            engine.shutdown();
            if failures > 0 {
                bail!("{failures} job(s) failed");
            }
        }

        Command::Probe { input, json } => {
            let report = probe::validate(&input, u64::MAX);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("valid:      {}", report.is_valid());
                println!("container:  {}", report.codec_tag.as_deref().unwrap_or("unknown"));
                if let (Some(w), Some(h)) = (report.width, report.height) {
                    println!("dimensions: {w}x{h}");
                }
                if let Some(fps) = report.fps {
                    println!("fps:        {fps:.2}");
                }
                if let Some(d) = report.duration_s {
                    println!("duration:   {d:.2}s");
                }
                if let Some(n) = report.frame_count {
                    println!("frames:     {n}");
                }
                for e in &report.errors {
                    println!("error:      {e}");
                }
                for w in &report.warnings {
                    println!("warning:    {w}");
                }
            }
            if !report.is_valid() {
                std::process::exit(1);
            }
        }

        Command::Estimate { input, payload_len } => {
            let report = probe::validate(&input, u64::MAX);
            let est = estimate::estimate(
                report.frame_count.unwrap_or(0),
                report.height.unwrap_or(0),
                payload_len,
                report.metadata_complete(),
            );
            println!("{:.1}s (confidence {:.1})", est.seconds, est.confidence);
        }
    }
    Ok(())
}

/// Progress sink that logs every update line to stderr.
fn progress_to_stderr() -> impl ProgressSink {
    FnSink(|percent: f32, message: &str| {
        info!(target: "progress", "{percent:5.1}%  {message}");
    })
}

//! frame_inspect - inspect frames coming from a capture source
//!
//! Reads frames without classifying or recording them, reports payload sizes
//! and whether each one decodes, and optionally dumps the JPEGs to a
//! directory or records the framed stream for later replay.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use engagement_monitor::ingest::SourceOptions;
use engagement_monitor::{decode_frame, write_frame, CaptureSource, EngagementError};

#[path = "../ui.rs"]
#[allow(dead_code)]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "frame_inspect",
    about = "Read frames from a capture source and report what arrives"
)]
struct Args {
    /// Capture source URI (serial://, http://, /dev/videoN, file path, stub://)
    #[arg(long, env = "ENGAGEMENT_SOURCE")]
    source: String,

    /// Stop after this many frames
    #[arg(long)]
    count: Option<u64>,

    /// Write every payload to DIR/frame_<n>.jpg
    #[arg(long, value_name = "DIR")]
    dump: Option<PathBuf>,

    /// Append every payload, framed, to FILE (replayable as a file source)
    #[arg(long, value_name = "FILE")]
    record: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let console = ui::Console::detect(&args.ui);

    let mut source = {
        let _stage = console.step("Connect capture source");
        let mut source = CaptureSource::open(&args.source, &SourceOptions::default())?;
        source.connect()?;
        source
    };
    if let Some(dir) = &args.dump {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let mut recorder = match &args.record {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => None,
    };

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .expect("install Ctrl-C handler");

    let mut seen = 0u64;
    let mut undecodable = 0u64;
    while !stop.load(Ordering::SeqCst) {
        if matches!(args.count, Some(count) if seen >= count) {
            break;
        }
        let payload = match source.next_frame() {
            Ok(Some(payload)) => payload,
            Ok(None) if source.is_exhausted() => break,
            Ok(None) => continue,
            Err(err) => match err.downcast_ref::<EngagementError>() {
                Some(framing) if framing.is_recoverable_framing() => {
                    println!("damaged frame: {}", framing);
                    continue;
                }
                _ => return Err(err),
            },
        };
        seen += 1;

        match decode_frame(&payload) {
            Ok(frame) => println!(
                "frame {:>6}: {:>8} bytes, {}x{}",
                seen,
                payload.len(),
                frame.width(),
                frame.height()
            ),
            Err(err) => {
                undecodable += 1;
                println!("frame {:>6}: {:>8} bytes, {}", seen, payload.len(), err);
            }
        }
        if let Some(dir) = &args.dump {
            std::fs::write(dir.join(format!("frame_{seen:06}.jpg")), &payload)?;
        }
        if let Some(recorder) = recorder.as_mut() {
            write_frame(recorder, &payload)?;
        }
    }

    if let Some(mut recorder) = recorder {
        recorder.flush()?;
    }
    let stats = source.stats();
    println!(
        "{}: {} frames, {} undecodable",
        stats.source, seen, undecodable
    );
    if let Some(framing) = stats.framing {
        println!(
            "framing: {} bytes discarded, {} short reads, {} oversized",
            framing.bytes_discarded, framing.short_reads, framing.oversized_frames
        );
    }
    Ok(())
}

//! engagement_monitor - run one monitoring session end to end
//!
//! Connects the capture source, classifies every frame, records it in the
//! session directory, forwards results to a collector when configured, and
//! prints the session summary when the source ends or Ctrl-C is pressed.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use engagement_monitor::{
    config::MonitorConfig,
    pipeline::{open_run, run_capture_loop_observed, stop_flag},
    CaptureSource, ClassifierRegistry, LoopOptions,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "engagement_monitor",
    about = "Capture, classify, and record student engagement for one session"
)]
struct Args {
    /// Respondent identifier (overrides ENGAGEMENT_RESPONDENT)
    #[arg(long)]
    respondent: Option<String>,

    /// Session label (default: today's date, YYYY-MM-DD)
    #[arg(long)]
    session: Option<String>,

    /// Capture source URI (serial://, http://, /dev/videoN, file path, stub://)
    #[arg(long)]
    source: Option<String>,

    /// Root directory for session artifacts
    #[arg(long, value_name = "DIR")]
    output_root: Option<PathBuf>,

    /// Classifier backend name
    #[arg(long)]
    classifier: Option<String>,

    /// Also write session_video.mjpeg
    #[arg(long)]
    video: bool,

    /// Collector URL (http(s):// or ws(s)://)
    #[arg(long)]
    forward_url: Option<String>,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Remove a stale session lock left by a crashed run
    #[arg(long)]
    force_unlock: bool,

    /// Print the summary as JSON on stdout
    #[arg(long)]
    json: bool,

    /// List classifier backends and exit
    #[arg(long)]
    list_classifiers: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let console = ui::Console::detect(&args.ui);

    let registry = ClassifierRegistry::with_builtin();
    if args.list_classifiers {
        for name in registry.list() {
            println!("{name}");
        }
        return Ok(());
    }

    let cfg = {
        let _stage = console.step("Load configuration");
        let mut cfg = MonitorConfig::load()?;
        apply_args(&mut cfg, &args);
        cfg
    };
    let respondent = cfg
        .respondent
        .clone()
        .ok_or_else(|| anyhow!("respondent is required (--respondent or ENGAGEMENT_RESPONDENT)"))?;
    let session_label = cfg
        .session_label
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());

    let classifier = {
        let _stage = console.step("Load classifier");
        let classifier = registry.select(&cfg.classifier)?;
        classifier
            .lock()
            .map_err(|_| anyhow!("classifier lock poisoned"))?
            .warm_up()
            .context("classifier warm-up")?;
        classifier
    };

    let mut source = {
        let _stage = console.step("Connect capture source");
        let mut source = CaptureSource::open(&cfg.source.uri, &cfg.source_options())?;
        source.connect()?;
        source
    };

    let stop = stop_flag();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .expect("install Ctrl-C handler");

    let (forwarder, mut session) = {
        let _stage = console.step("Start session");
        open_run(&cfg, &respondent, &session_label, args.force_unlock)?
    };

    log::info!(
        "monitoring {}/{} from {} (Ctrl-C to stop)",
        respondent,
        session_label,
        cfg.source.uri
    );
    let mut ticker = console.frame_ticker(25);
    let loop_result = run_capture_loop_observed(
        &mut source,
        &classifier,
        &mut session,
        &forwarder,
        &stop,
        &LoopOptions {
            max_frames: args.max_frames,
        },
        |record, _status| ticker.tick(&record.frame_name, record.level),
    );
    ticker.finish();

    let summary = {
        let _stage = console.step("Close session");
        session.stop_session()?
    };
    let forward_stats = forwarder.shutdown();
    if forward_stats.submitted > 0 {
        log::info!(
            "forwarded {} of {} results ({} failed, {} dropped)",
            forward_stats.delivered,
            forward_stats.submitted,
            forward_stats.failed,
            forward_stats.dropped
        );
    }

    let stats = loop_result?;
    if stats.framing_errors > 0 || stats.decode_failures > 0 {
        log::warn!(
            "{} damaged frames skipped, {} frames failed to decode",
            stats.framing_errors,
            stats.decode_failures
        );
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

fn apply_args(cfg: &mut MonitorConfig, args: &Args) {
    if let Some(respondent) = &args.respondent {
        cfg.respondent = Some(respondent.clone());
    }
    if let Some(session) = &args.session {
        cfg.session_label = Some(session.clone());
    }
    if let Some(source) = &args.source {
        cfg.source.uri = source.clone();
    }
    if let Some(root) = &args.output_root {
        cfg.output_root = root.clone();
    }
    if let Some(classifier) = &args.classifier {
        cfg.classifier = classifier.clone();
    }
    if args.video {
        cfg.video = true;
    }
    if let Some(url) = &args.forward_url {
        cfg.forward.url = Some(url.clone());
    }
}

//! engagement_edge - accept frames pushed by Wi-Fi cameras
//!
//! Runs the edge ingest server: cameras POST JPEGs to `/upload_frame`, and
//! sessions are started and stopped over HTTP. Every frame is classified,
//! recorded under the output root, and forwarded when a collector URL is
//! configured. Runs until Ctrl-C, closing the active session on the way out.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use engagement_monitor::config::{MonitorConfig, DEFAULT_EDGE_ADDR};
use engagement_monitor::edge::EdgeServer;
use engagement_monitor::pipeline::stop_flag;
use engagement_monitor::{ClassifierRegistry, Forwarder};

#[derive(Parser, Debug)]
#[command(
    name = "engagement_edge",
    about = "Receive, classify, and record frames pushed by cameras"
)]
struct Args {
    /// HTTP listen address
    #[arg(long, env = "ENGAGEMENT_EDGE_ADDR", default_value = DEFAULT_EDGE_ADDR)]
    addr: String,

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
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = MonitorConfig::load()?;
    if let Some(root) = args.output_root {
        cfg.output_root = root;
    }
    if let Some(classifier) = args.classifier {
        cfg.classifier = classifier;
    }
    if args.video {
        cfg.video = true;
    }
    if let Some(url) = args.forward_url {
        cfg.forward.url = Some(url);
    }

    let classifier = ClassifierRegistry::with_builtin().select(&cfg.classifier)?;
    classifier
        .lock()
        .map_err(|_| anyhow!("classifier lock poisoned"))?
        .warm_up()
        .context("classifier warm-up")?;
    let forwarder = Forwarder::start(&cfg.forward_config())?;

    let stop = stop_flag();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .expect("install Ctrl-C handler");

    let handle = EdgeServer::new(cfg.edge_config(&args.addr), classifier, forwarder).spawn()?;
    log::info!(
        "edge ready on http://{}, sessions under {} (Ctrl-C to stop)",
        handle.addr,
        cfg.output_root.display()
    );

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutting down edge server");
    let report = handle.stop()?;
    log::info!(
        "{} sessions closed, {} frames recorded, {} results forwarded",
        report.sessions_closed,
        report.frames_recorded,
        report.forward.delivered
    );
    if let Some(summary) = report.last_summary {
        print!("{}", summary.render());
    }
    Ok(())
}

//! engagement_collector - receive forwarded results from monitors
//!
//! Appends every result to `<root>/responden_<r>/sesi_<s>/engagement_metadata.csv`
//! and serves per-session reports on `/check_results`. Runs until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engagement_monitor::collector::CollectorServer;
use engagement_monitor::config::CollectorConfig;

#[derive(Parser, Debug)]
#[command(
    name = "engagement_collector",
    about = "Collect engagement results forwarded by monitors"
)]
struct Args {
    /// HTTP listen address (overrides ENGAGEMENT_COLLECTOR_ADDR)
    #[arg(long)]
    addr: Option<String>,

    /// WebSocket listen address (overrides ENGAGEMENT_COLLECTOR_WS_ADDR)
    #[arg(long)]
    ws_addr: Option<String>,

    /// Directory for per-session metadata (overrides ENGAGEMENT_COLLECTOR_ROOT)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Also append every result to <root>/logs/engagement_log.csv
    #[arg(long)]
    global_log: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = CollectorConfig::load()?;
    if let Some(addr) = args.addr {
        cfg.addr = addr;
    }
    if let Some(ws_addr) = args.ws_addr {
        cfg.ws_addr = Some(ws_addr);
    }
    if let Some(root) = args.root {
        cfg.root = root;
    }
    if args.global_log {
        cfg.global_log = true;
    }

    let handle = CollectorServer::new(cfg).spawn()?;
    log::info!("collector ready on http://{} (Ctrl-C to stop)", handle.addr);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .expect("install Ctrl-C handler");

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutting down collector");
    handle.stop()
}

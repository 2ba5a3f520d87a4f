//! session_report - summarize an existing session
//!
//! Accepts either a results CSV or a session directory containing
//! `engagement_results.csv`, and prints the per-level breakdown and verdict.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use engagement_monitor::session::RESULTS_LOG_FILE;
use engagement_monitor::summarize_log;

#[path = "../ui.rs"]
#[allow(dead_code)]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "session_report",
    about = "Print the engagement summary of a recorded session"
)]
struct Args {
    /// Results CSV or session directory
    path: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let console = ui::Console::detect(&args.ui);

    let csv = if args.path.is_dir() {
        args.path.join(RESULTS_LOG_FILE)
    } else {
        args.path.clone()
    };
    if !csv.exists() {
        return Err(anyhow!("results log not found: {}", csv.display()));
    }

    let summary = {
        let _stage = console.step("Summarize results log");
        summarize_log(&csv)?
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

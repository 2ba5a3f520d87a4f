//! Stderr progress for the command-line tools.
//!
//! Pretty output (spinners) is only used when both stderr and stdout are
//! terminals, so piping a report into `jq` keeps the console plain.

use indicatif::{HumanDuration, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleMode {
    Auto,
    Plain,
    Pretty,
}

impl ConsoleMode {
    /// Unknown values fall back to `Auto`.
    pub fn parse(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "plain" => ConsoleMode::Plain,
            "pretty" => ConsoleMode::Pretty,
            _ => ConsoleMode::Auto,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Console {
    pretty: bool,
}

impl Console {
    pub fn detect(flag: &str) -> Self {
        let stderr_tty = std::io::stderr().is_terminal();
        let stdout_tty = std::io::stdout().is_terminal();
        Self::resolve(ConsoleMode::parse(flag), stderr_tty, stdout_tty)
    }

    fn resolve(mode: ConsoleMode, stderr_tty: bool, stdout_tty: bool) -> Self {
        let pretty = match mode {
            ConsoleMode::Plain => false,
            ConsoleMode::Pretty => stderr_tty,
            ConsoleMode::Auto => stderr_tty && stdout_tty,
        };
        Self { pretty }
    }

    /// Announce a setup step; completion and elapsed time are reported when
    /// the returned guard drops.
    pub fn step(&self, label: &str) -> Step {
        let bar = if self.pretty {
            Some(spinner_bar("{spinner} {msg}", format!("{label}…")))
        } else {
            eprintln!("==> {label}");
            None
        };
        Step {
            label: label.to_string(),
            started: Instant::now(),
            bar,
        }
    }

    /// Running frame count for the capture loop. Plain mode logs a line every
    /// `plain_every` frames.
    pub fn frame_ticker(&self, plain_every: u64) -> FrameTicker {
        let bar = self
            .pretty
            .then(|| spinner_bar("{spinner} {pos} frames [{elapsed}] {msg}", String::new()));
        FrameTicker {
            bar,
            plain_every: plain_every.max(1),
            frames: 0,
            started: Instant::now(),
        }
    }
}

fn spinner_bar(template: &str, message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.set_style(
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

pub struct Step {
    label: String,
    started: Instant,
    bar: Option<ProgressBar>,
}

impl Drop for Step {
    fn drop(&mut self) {
        let done = format!("✔ {} ({})", self.label, HumanDuration(self.started.elapsed()));
        match self.bar.take() {
            Some(bar) => bar.finish_with_message(done),
            None => eprintln!("{done}"),
        }
    }
}

pub struct FrameTicker {
    bar: Option<ProgressBar>,
    plain_every: u64,
    frames: u64,
    started: Instant,
}

impl FrameTicker {
    pub fn tick(&mut self, frame_name: &str, level: impl std::fmt::Display) {
        self.frames += 1;
        match &self.bar {
            Some(bar) => {
                bar.inc(1);
                bar.set_message(format!("{frame_name} -> {level}"));
            }
            None if self.frames % self.plain_every == 0 => {
                eprintln!("    {} frames, last {frame_name} -> {level}", self.frames)
            }
            None => {}
        }
    }

    pub fn finish(self) {
        let done = format!(
            "✔ captured {} frames ({})",
            self.frames,
            HumanDuration(self.started.elapsed())
        );
        match self.bar {
            Some(bar) => bar.finish_with_message(done),
            None => eprintln!("{done}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flag_parsing() {
        assert_eq!(ConsoleMode::parse("plain"), ConsoleMode::Plain);
        assert_eq!(ConsoleMode::parse(" Pretty "), ConsoleMode::Pretty);
        assert_eq!(ConsoleMode::parse("fancy"), ConsoleMode::Auto);
    }

    #[test]
    fn auto_needs_both_streams_on_a_terminal() {
        assert!(Console::resolve(ConsoleMode::Auto, true, true).pretty);
        assert!(!Console::resolve(ConsoleMode::Auto, true, false).pretty);
        assert!(Console::resolve(ConsoleMode::Pretty, true, false).pretty);
        assert!(!Console::resolve(ConsoleMode::Pretty, false, true).pretty);
        assert!(!Console::resolve(ConsoleMode::Plain, true, true).pretty);
    }
}

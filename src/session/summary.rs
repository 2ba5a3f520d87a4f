use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::EngagementLevel;

/// Binary session outcome: HIGH iff tiers 2+3 strictly outnumber tiers 0+1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngagementVerdict {
    Low,
    High,
}

impl fmt::Display for EngagementVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngagementVerdict::Low => write!(f, "LOW"),
            EngagementVerdict::High => write!(f, "HIGH"),
        }
    }
}

/// Running per-level frame counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub no_detection: u64,
    pub tiers: [u64; 4],
}

impl LevelCounts {
    pub fn from_tiers(tiers: [u64; 4]) -> Self {
        Self {
            no_detection: 0,
            tiers,
        }
    }

    pub fn record(&mut self, level: EngagementLevel) {
        match level.tier_index() {
            Some(idx) => self.tiers[idx] += 1,
            None => self.no_detection += 1,
        }
    }

    /// Frames that landed in one of the four tiers.
    pub fn detected(&self) -> u64 {
        self.tiers.iter().sum()
    }

    pub fn total(&self) -> u64 {
        self.detected() + self.no_detection
    }

    pub fn low(&self) -> u64 {
        self.tiers[0] + self.tiers[1]
    }

    pub fn high(&self) -> u64 {
        self.tiers[2] + self.tiers[3]
    }

    /// Share of detected frames per tier, in percent. All zero when nothing
    /// was detected.
    pub fn percentages(&self) -> [f64; 4] {
        let detected = self.detected();
        let mut out = [0.0; 4];
        if detected == 0 {
            return out;
        }
        for (slot, count) in out.iter_mut().zip(self.tiers.iter()) {
            *slot = *count as f64 / detected as f64 * 100.0;
        }
        out
    }

    pub fn verdict(&self) -> EngagementVerdict {
        if self.high() > self.low() {
            EngagementVerdict::High
        } else {
            EngagementVerdict::Low
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub respondent: String,
    pub session_label: String,
    pub started_at: Option<String>,
    pub total_frames: u64,
    pub no_detection_frames: u64,
    pub level_counts: [u64; 4],
    pub level_percentages: [f64; 4],
    pub mean_response_time: f64,
    pub mean_fps: f64,
    pub verdict: EngagementVerdict,
}

impl SessionSummary {
    pub fn from_counts(
        respondent: &str,
        session_label: &str,
        started_at: Option<String>,
        counts: &LevelCounts,
        response_time_sum: f64,
        fps_sum: f64,
    ) -> Self {
        let total = counts.total();
        let mean = |sum: f64| if total == 0 { 0.0 } else { sum / total as f64 };
        Self {
            respondent: respondent.to_string(),
            session_label: session_label.to_string(),
            started_at,
            total_frames: total,
            no_detection_frames: counts.no_detection,
            level_counts: counts.tiers,
            level_percentages: counts.percentages(),
            mean_response_time: mean(response_time_sum),
            mean_fps: mean(fps_sum),
            verdict: counts.verdict(),
        }
    }

    /// Human-readable report, one line per tier.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Engagement summary for {} / {}\n",
            self.respondent, self.session_label
        );
        for (idx, (count, pct)) in self
            .level_counts
            .iter()
            .zip(self.level_percentages.iter())
            .enumerate()
        {
            out.push_str(&format!("  level {}: {} ({:.2}%)\n", idx, count, pct));
        }
        out.push_str(&format!(
            "  no detection: {}\n  total frames: {}\n  mean response time: {:.4}s ({:.2} fps)\n",
            self.no_detection_frames, self.total_frames, self.mean_response_time, self.mean_fps
        ));
        out.push_str(&format!("FINAL RESULT: {} ENGAGEMENT\n", self.verdict));
        out
    }
}

/// Rebuild a summary from an existing `engagement_results.csv`.
///
/// Columns are located by header name. Respondent and session label are taken
/// from the two enclosing directory names. Rows with an unknown level are
/// skipped with a warning.
pub fn summarize_log(path: &Path) -> Result<SessionSummary> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read results log {}", path.display()))?;
    let mut lines = raw.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("results log {} is empty", path.display()))?;
    let columns: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| anyhow!("results log {} has no '{}' column", path.display(), name))
    };
    let level_idx = column("engagement_level")?;
    let rt_idx = column("response_time")?;
    let fps_idx = column("fps")?;

    let mut counts = LevelCounts::default();
    let mut rt_sum = 0.0;
    let mut fps_sum = 0.0;
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        let level = fields
            .get(level_idx)
            .and_then(|v| v.parse::<i32>().ok())
            .and_then(|v| EngagementLevel::from_i32(v).ok());
        let Some(level) = level else {
            log::warn!(
                "results log {}: skipping row {} with unusable level",
                path.display(),
                line_no + 2
            );
            continue;
        };
        counts.record(level);
        rt_sum += parse_number(fields.get(rt_idx));
        fps_sum += parse_number(fields.get(fps_idx));
    }

    let session_dir = path.parent();
    let label = dir_name(session_dir);
    let respondent = dir_name(session_dir.and_then(|dir| dir.parent()));
    Ok(SessionSummary::from_counts(
        &respondent,
        &label,
        None,
        &counts,
        rt_sum,
        fps_sum,
    ))
}

fn parse_number(field: Option<&&str>) -> f64 {
    field
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn dir_name(dir: Option<&Path>) -> String {
    dir.and_then(|d| d.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

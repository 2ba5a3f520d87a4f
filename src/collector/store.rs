//! Per-session metadata CSVs kept by the collector.
//!
//! ```text
//! <root>/responden_<r>/sesi_<s>/engagement_metadata.csv
//! <root>/logs/engagement_log.csv      (optional, every session)
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::forward::ResultPayload;
use crate::session::{EngagementVerdict, LevelCounts};
use crate::{validate_identifier, EngagementLevel};

pub const METADATA_FILE: &str = "engagement_metadata.csv";
pub const METADATA_HEADER: &str =
    "server_timestamp,responden,sesi,frame_name,engagement_level,fps,response_time";
/// Cross-session log, relative to the collector root. Same columns as the
/// per-session CSVs.
pub const GLOBAL_LOG_FILE: &str = "logs/engagement_log.csv";

/// Counts and percentages for one session, as returned by `/check_results`.
///
/// Percentages are over frames with a detected face; `total_frames` counts
/// those frames only. Frames without a detection are reported separately.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultsReport {
    pub responden: String,
    pub sesi: String,
    pub total_frames: u64,
    pub no_detection_frames: u64,
    pub engagement_counts: BTreeMap<String, u64>,
    pub engagement_percentages: BTreeMap<String, f64>,
    pub verdict: EngagementVerdict,
}

/// Clones share one append lock, so HTTP and WebSocket writers never
/// interleave a header with a row.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    root: PathBuf,
    global_log: Option<PathBuf>,
    append_lock: Arc<Mutex<()>>,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            global_log: None,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Also copy every accepted row into [`GLOBAL_LOG_FILE`].
    pub fn with_global_log(mut self, enabled: bool) -> Self {
        self.global_log = enabled.then(|| self.root.join(GLOBAL_LOG_FILE));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn global_log(&self) -> Option<&Path> {
        self.global_log.as_deref()
    }

    pub fn session_csv(&self, respondent: &str, session: &str) -> Result<PathBuf> {
        validate_identifier("responden", respondent)?;
        validate_identifier("sesi", session)?;
        Ok(self
            .root
            .join(format!("responden_{}", respondent))
            .join(format!("sesi_{}", session))
            .join(METADATA_FILE))
    }

    /// Append one row, creating the directory and header on first use.
    pub fn append(&self, payload: &ResultPayload) -> Result<PathBuf> {
        let path = self.session_csv(&payload.responden, &payload.sesi)?;
        if payload.frame.is_empty() || payload.frame.contains([',', '\n', '\r', '"']) {
            return Err(anyhow!("invalid frame name {:?}", payload.frame));
        }
        for (name, value) in [("fps", payload.fps), ("response_time", payload.response_time)] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("invalid {} {}", name, value));
            }
        }
        let row = format!(
            "{},{},{},{},{},{},{}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
            payload.responden,
            payload.sesi,
            payload.frame,
            payload.engagement_level,
            payload.fps,
            payload.response_time
        );

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| anyhow!("metadata append lock poisoned"))?;
        append_row(&path, &row)?;
        if let Some(global) = &self.global_log {
            append_row(global, &row)?;
        }
        Ok(path)
    }

    /// Report for a session, or `None` when it has no metadata file.
    pub fn report(&self, respondent: &str, session: &str) -> Result<Option<ResultsReport>> {
        let path = self.session_csv(respondent, session)?;
        if !path.exists() {
            return Ok(None);
        }
        let counts = count_levels(&path)?;
        let percentages = counts.percentages();

        let mut engagement_counts = BTreeMap::new();
        let mut engagement_percentages = BTreeMap::new();
        for (idx, level) in EngagementLevel::ALL_TIERS.iter().enumerate() {
            engagement_counts.insert(level.to_string(), counts.tiers[idx]);
            engagement_percentages.insert(level.to_string(), percentages[idx]);
        }
        Ok(Some(ResultsReport {
            responden: respondent.to_string(),
            sesi: session.to_string(),
            total_frames: counts.detected(),
            no_detection_frames: counts.no_detection,
            engagement_counts,
            engagement_percentages,
            verdict: counts.verdict(),
        }))
    }
}

/// Append `row` to the CSV at `path`, creating its directory and header on
/// first use. Callers hold the append lock.
fn append_row(path: &Path, row: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", METADATA_HEADER)?;
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(anyhow::Error::new(err).context(format!("create csv {}", path.display())))
        }
    }
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("open csv {}", path.display()))?;
    file.write_all(row.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn count_levels(path: &Path) -> Result<LevelCounts> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open metadata csv {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| anyhow!("metadata csv {} is empty", path.display()))?;
    let level_column = header
        .split(',')
        .position(|name| name.trim() == "engagement_level")
        .ok_or_else(|| anyhow!("metadata csv {} has no engagement_level column", path.display()))?;

    let mut counts = LevelCounts::default();
    for (idx, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let level = line
            .split(',')
            .nth(level_column)
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .and_then(|raw| EngagementLevel::from_i32(raw).ok());
        match level {
            Some(level) => counts.record(level),
            None => log::warn!(
                "{}:{}: skipping row with unreadable engagement level",
                path.display(),
                idx + 2
            ),
        }
    }
    Ok(counts)
}

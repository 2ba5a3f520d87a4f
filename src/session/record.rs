use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::EngagementLevel;

/// Column order of `engagement_results.csv`.
pub const RESULTS_LOG_HEADER: &str =
    "timestamp,frame_name,engagement_level,confidence,response_time,fps";

/// One classified frame, as persisted in the results log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameRecord {
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub frame_name: String,
    pub level: EngagementLevel,
    /// Meaningless (0.0) when `level` is `NoDetection`.
    pub confidence: f32,
    /// Seconds spent decoding and classifying.
    pub response_time: f64,
    pub fps: f64,
}

impl FrameRecord {
    /// Newline-terminated CSV row. No field can contain a comma: frame names
    /// are generated and the rest are numbers.
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{:.6},{:.6},{:.3}\n",
            self.timestamp_ms,
            self.frame_name,
            self.level.as_i32(),
            self.confidence,
            self.response_time,
            self.fps
        )
    }
}

/// Throughput derived from one response time; 0 when the measurement is 0.
pub fn derived_fps(response_time: f64) -> f64 {
    if response_time > 0.0 {
        1.0 / response_time
    } else {
        0.0
    }
}

/// Collision-free frame name: millisecond timestamp plus a per-session sequence.
pub fn frame_name(timestamp_ms: i64, sequence: u64) -> String {
    format!("frame_{}_{:06}.jpg", timestamp_ms, sequence)
}

/// Append-only results log. Every row is flushed before `append` returns, so
/// the file is consistent up to the last completed call.
pub(crate) struct ResultsLog {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl ResultsLog {
    /// Create (or truncate) the log and write its header row.
    pub(crate) fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(RESULTS_LOG_HEADER.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub(crate) fn append(&mut self, record: &FrameRecord) -> std::io::Result<()> {
        self.writer.write_all(record.to_csv_row().as_bytes())?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub(crate) fn close(mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        log::debug!(
            "results log {} closed after {} rows",
            self.path.display(),
            self.rows
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_falls_back_to_zero() {
        assert_eq!(derived_fps(0.0), 0.0);
        assert_eq!(derived_fps(0.5), 2.0);
        assert_eq!(derived_fps(0.25), 4.0);
    }

    #[test]
    fn csv_row_matches_header_shape() {
        let record = FrameRecord {
            timestamp_ms: 1_700_000_000_123,
            frame_name: frame_name(1_700_000_000_123, 7),
            level: EngagementLevel::Level2,
            confidence: 0.875,
            response_time: 0.05,
            fps: 20.0,
        };
        let row = record.to_csv_row();
        assert!(row.ends_with('\n'));
        let fields: Vec<&str> = row.trim_end().split(',').collect();
        assert_eq!(fields.len(), RESULTS_LOG_HEADER.split(',').count());
        assert_eq!(fields[0], "1700000000123");
        assert_eq!(fields[1], "frame_1700000000123_000007.jpg");
        assert_eq!(fields[2], "2");
        assert_eq!(fields[3], "0.875000");
        assert_eq!(fields[5], "20.000");
    }

    #[test]
    fn frame_names_differ_within_one_millisecond() {
        assert_ne!(frame_name(42, 1), frame_name(42, 2));
    }
}

//! Session lifecycle and on-disk layout.
//!
//! ```text
//! <root>/<respondent>/<session_label>/
//!   engagement_results.csv
//!   session_video.mjpeg        (optional)
//!   session_summary.json       (written on stop)
//!   engagement/0/ .. engagement/3/
//! ```
//!
//! A session is `ACTIVE` from `start_session` until `stop_session`, then
//! `CLOSED` for good. While active, the handle exclusively owns the results log,
//! the video sink, and a `.session.lock` file created with exclusive-create
//! semantics, so two starts for the same identifier cannot interleave.
//!
//! Restarting an identifier after a clean stop resets the session: the results
//! log is truncated and its header rewritten. Bucketed images from earlier runs
//! are left in place.

mod record;
mod summary;
mod video;

use chrono::{DateTime, Local, Utc};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::EngagementError;
use crate::{validate_identifier, EngagementLevel};

use record::ResultsLog;

pub use record::{derived_fps, frame_name, FrameRecord, RESULTS_LOG_HEADER};
pub use summary::{summarize_log, EngagementVerdict, LevelCounts, SessionSummary};
pub use video::{MjpegVideoSink, VideoSink};

pub const RESULTS_LOG_FILE: &str = "engagement_results.csv";
pub const VIDEO_FILE: &str = "session_video.mjpeg";
pub const SUMMARY_FILE: &str = "session_summary.json";
pub const BUCKETS_DIR: &str = "engagement";
pub const LOCK_FILE: &str = ".session.lock";

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// Write every JPEG frame to `session_video.mjpeg`.
    pub video: bool,
    /// Remove a stale lock left by a crashed run before starting.
    pub force_unlock: bool,
}

/// Paths of one session directory tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionLayout {
    dir: PathBuf,
}

impl SessionLayout {
    pub fn new(output_root: &Path, respondent: &str, session_label: &str) -> Self {
        Self {
            dir: output_root.join(respondent).join(session_label),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn results_log(&self) -> PathBuf {
        self.dir.join(RESULTS_LOG_FILE)
    }

    pub fn video(&self) -> PathBuf {
        self.dir.join(VIDEO_FILE)
    }

    pub fn summary(&self) -> PathBuf {
        self.dir.join(SUMMARY_FILE)
    }

    pub fn buckets_dir(&self) -> PathBuf {
        self.dir.join(BUCKETS_DIR)
    }

    /// Bucket for a tier; `None` for `NoDetection`.
    pub fn bucket(&self, level: EngagementLevel) -> Option<PathBuf> {
        level
            .bucket_name()
            .map(|name| self.buckets_dir().join(name))
    }

    pub fn lock(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closed,
}

/// Exclusive owner of one session's artifacts.
pub struct SessionHandle {
    respondent: String,
    session_label: String,
    layout: SessionLayout,
    started_at: DateTime<Local>,
    state: SessionState,
    log: Option<ResultsLog>,
    video: Option<Box<dyn VideoSink>>,
    counts: LevelCounts,
    response_time_sum: f64,
    fps_sum: f64,
    sequence: u64,
    lock_held: bool,
}

/// Start (or reset) the session `respondent_id / session_label` under `output_root`.
///
/// Creates the directory tree and all four buckets, takes the session lock,
/// truncates the results log and writes its header, and opens the video sink
/// when requested. Fails with `DirectoryConflict` while another handle holds
/// the same session.
pub fn start_session(
    respondent_id: &str,
    session_label: &str,
    output_root: impl AsRef<Path>,
    options: SessionOptions,
) -> Result<SessionHandle, EngagementError> {
    validate_identifier("respondent", respondent_id)?;
    validate_identifier("session", session_label)?;

    let layout = SessionLayout::new(output_root.as_ref(), respondent_id, session_label);
    std::fs::create_dir_all(layout.dir())?;

    if options.force_unlock {
        match std::fs::remove_file(layout.lock()) {
            Ok(()) => log::warn!("removed stale session lock {}", layout.lock().display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    acquire_lock(&layout)?;

    let opened = open_artifacts(&layout, &options);
    let (log, video) = match opened {
        Ok(artifacts) => artifacts,
        Err(err) => {
            release_lock(&layout);
            return Err(err);
        }
    };

    log::info!(
        "session {}/{} started in {} (video={})",
        respondent_id,
        session_label,
        layout.dir().display(),
        video.is_some()
    );

    Ok(SessionHandle {
        respondent: respondent_id.to_string(),
        session_label: session_label.to_string(),
        layout,
        started_at: Local::now(),
        state: SessionState::Active,
        log: Some(log),
        video,
        counts: LevelCounts::default(),
        response_time_sum: 0.0,
        fps_sum: 0.0,
        sequence: 0,
        lock_held: true,
    })
}

fn acquire_lock(layout: &SessionLayout) -> Result<(), EngagementError> {
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(layout.lock())
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(EngagementError::DirectoryConflict(layout.dir().to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    let stamp = format!("pid={} started={}\n", std::process::id(), Local::now().to_rfc3339());
    if let Err(err) = file.write_all(stamp.as_bytes()) {
        release_lock(layout);
        return Err(err.into());
    }
    Ok(())
}

fn release_lock(layout: &SessionLayout) {
    if let Err(err) = std::fs::remove_file(layout.lock()) {
        if err.kind() != ErrorKind::NotFound {
            log::warn!(
                "failed to remove session lock {}: {}",
                layout.lock().display(),
                err
            );
        }
    }
}

fn open_artifacts(
    layout: &SessionLayout,
    options: &SessionOptions,
) -> Result<(ResultsLog, Option<Box<dyn VideoSink>>), EngagementError> {
    for level in EngagementLevel::ALL_TIERS {
        if let Some(bucket) = layout.bucket(level) {
            std::fs::create_dir_all(bucket)?;
        }
    }

    let log_path = layout.results_log();
    if log_path.exists() {
        log::info!("resetting existing results log {}", log_path.display());
    }
    let log = ResultsLog::create(&log_path)?;

    let video: Option<Box<dyn VideoSink>> = if options.video {
        Some(Box::new(MjpegVideoSink::create(&layout.video())?))
    } else {
        None
    };
    Ok((log, video))
}

impl SessionHandle {
    pub fn respondent(&self) -> &str {
        &self.respondent
    }

    pub fn session_label(&self) -> &str {
        &self.session_label
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn frames_recorded(&self) -> u64 {
        self.counts.total()
    }

    /// Persist one classified frame.
    ///
    /// Order of effects: bucket image (detections only), results-log row,
    /// video frame. A rejected measurement leaves no trace on disk.
    pub fn record_frame(
        &mut self,
        raw_image: &[u8],
        level: EngagementLevel,
        confidence: f32,
        response_time: f64,
    ) -> Result<FrameRecord, EngagementError> {
        if self.state == SessionState::Closed {
            return Err(EngagementError::SessionClosed);
        }
        if !response_time.is_finite() || response_time < 0.0 {
            log::warn!(
                "session {}/{}: rejecting frame with response time {}",
                self.respondent,
                self.session_label,
                response_time
            );
            return Err(EngagementError::InvalidMeasurement(response_time));
        }

        let timestamp_ms = Utc::now().timestamp_millis();
        let sequence = self.sequence + 1;
        let confidence = if level.is_detection() && confidence.is_finite() {
            confidence
        } else {
            0.0
        };
        let record = FrameRecord {
            timestamp_ms,
            frame_name: frame_name(timestamp_ms, sequence),
            level,
            confidence,
            response_time,
            fps: derived_fps(response_time),
        };

        if let Some(bucket) = self.layout.bucket(level) {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(bucket.join(&record.frame_name))?;
            file.write_all(raw_image)?;
        }

        let log = self.log.as_mut().ok_or(EngagementError::SessionClosed)?;
        log.append(&record)?;
        self.sequence = sequence;
        self.counts.record(level);
        self.response_time_sum += record.response_time;
        self.fps_sum += record.fps;

        if let Some(video) = self.video.as_mut() {
            if let Err(err) = video.append(raw_image) {
                log::warn!(
                    "session {}/{}: video sink failed, disabling video: {}",
                    self.respondent,
                    self.session_label,
                    err
                );
                self.video = None;
            }
        }

        Ok(record)
    }

    /// Snapshot of the counts so far.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary::from_counts(
            &self.respondent,
            &self.session_label,
            Some(self.started_at.to_rfc3339()),
            &self.counts,
            self.response_time_sum,
            self.fps_sum,
        )
    }

    /// Close the session and compute its summary.
    ///
    /// Releases every resource even when one of the closes fails; the first
    /// failure is returned after the rest have been attempted. The handle is
    /// `CLOSED` afterwards regardless of the outcome.
    pub fn stop_session(&mut self) -> Result<SessionSummary, EngagementError> {
        if self.state == SessionState::Closed {
            return Err(EngagementError::SessionClosed);
        }
        self.state = SessionState::Closed;
        let released = self.release();

        let summary = self.summary();
        released?;
        write_summary(&self.layout.summary(), &summary)?;
        log::info!(
            "session {}/{} stopped: {} frames, verdict {}",
            self.respondent,
            self.session_label,
            summary.total_frames,
            summary.verdict
        );
        Ok(summary)
    }

    fn release(&mut self) -> Result<(), EngagementError> {
        let mut first_err: Option<EngagementError> = None;

        if let Some(mut video) = self.video.take() {
            if let Err(err) = video.finish() {
                log::error!("failed to finish session video: {}", err);
                first_err.get_or_insert(err.into());
            }
        }
        if let Some(log) = self.log.take() {
            if let Err(err) = log.close() {
                log::error!("failed to close results log: {}", err);
                first_err.get_or_insert(err.into());
            }
        }
        if self.lock_held {
            release_lock(&self.layout);
            self.lock_held = false;
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.state == SessionState::Active {
            log::warn!(
                "session {}/{} dropped without stop; releasing resources",
                self.respondent,
                self.session_label
            );
            self.state = SessionState::Closed;
            if let Err(err) = self.release() {
                log::error!("release on drop failed: {}", err);
            }
        }
    }
}

fn write_summary(path: &Path, summary: &SessionSummary) -> Result<(), EngagementError> {
    let json = serde_json::to_vec_pretty(summary).map_err(std::io::Error::other)?;
    let mut file = File::create(path)?;
    file.write_all(&json)?;
    file.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_places_buckets_under_engagement() {
        let layout = SessionLayout::new(Path::new("/data"), "alice", "s1");
        assert_eq!(layout.dir(), Path::new("/data/alice/s1"));
        assert_eq!(
            layout.bucket(EngagementLevel::Level1).unwrap(),
            Path::new("/data/alice/s1/engagement/1")
        );
        assert!(layout.bucket(EngagementLevel::NoDetection).is_none());
    }

    #[test]
    fn failed_start_does_not_leave_a_lock() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path(), "alice", "s1");
        std::fs::create_dir_all(layout.dir()).unwrap();
        // A regular file where the bucket directory should go.
        std::fs::write(layout.buckets_dir(), b"not a dir").unwrap();

        let result = start_session("alice", "s1", dir.path(), SessionOptions::default());
        assert!(result.is_err());
        assert!(!layout.lock().exists());
    }

    #[test]
    fn confidence_is_zeroed_without_detection() {
        let dir = tempdir().unwrap();
        let mut session =
            start_session("bob", "s1", dir.path(), SessionOptions::default()).unwrap();
        let record = session
            .record_frame(b"", EngagementLevel::NoDetection, 0.9, 0.1)
            .unwrap();
        assert_eq!(record.confidence, 0.0);
        session.stop_session().unwrap();
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempdir().unwrap();
        let session = start_session("carol", "s1", dir.path(), SessionOptions::default()).unwrap();
        let lock = session.layout().lock();
        assert!(lock.exists());
        drop(session);
        assert!(!lock.exists());
    }
}

//! The capture loop.
//!
//! One synchronous cycle per frame: read, classify, record, forward. A slow
//! classifier slows the reads; nothing is buffered between capture and the
//! results log. The stop flag is checked before every blocking read, so a
//! stop request takes effect within one source read timeout and never in the
//! middle of a row.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::classify::{classify_payload, EngagementClassifier, PayloadStatus};
use crate::config::MonitorConfig;
use crate::error::EngagementError;
use crate::forward::{Forwarder, ResultPayload};
use crate::ingest::CaptureSource;
use crate::session::{start_session, FrameRecord, SessionHandle, SessionOptions};

/// Cooperative cancellation flag shared with signal handlers.
pub type StopFlag = Arc<AtomicBool>;

pub fn stop_flag() -> StopFlag {
    Arc::new(AtomicBool::new(false))
}

#[derive(Clone, Debug, Default)]
pub struct LoopOptions {
    /// Stop after this many recorded frames.
    pub max_frames: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopReason {
    #[default]
    Requested,
    SourceExhausted,
    FrameLimit,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames_recorded: u64,
    pub detections: u64,
    pub decode_failures: u64,
    pub classifier_failures: u64,
    /// Short reads and oversized frames skipped by the source.
    pub framing_errors: u64,
    pub rejected_measurements: u64,
    /// Reads that timed out without a frame.
    pub idle_polls: u64,
    pub forwarded: u64,
    pub stop_reason: StopReason,
}

/// Build the forwarder, then start the session.
///
/// `start_session` truncates an existing results log, so every fallible
/// setup step for the run has to come first.
pub fn open_run(
    cfg: &MonitorConfig,
    respondent: &str,
    session_label: &str,
    force_unlock: bool,
) -> Result<(Forwarder, SessionHandle)> {
    let forwarder = Forwarder::start(&cfg.forward_config())?;
    let session = start_session(
        respondent,
        session_label,
        &cfg.output_root,
        SessionOptions {
            video: cfg.video,
            force_unlock,
        },
    )
    .with_context(|| format!("start session {}/{}", respondent, session_label))?;
    Ok((forwarder, session))
}

/// Run until `stop` is set, the source is exhausted, or `max_frames` is hit.
pub fn run_capture_loop(
    source: &mut CaptureSource,
    classifier: &Mutex<dyn EngagementClassifier>,
    session: &mut SessionHandle,
    forwarder: &Forwarder,
    stop: &AtomicBool,
    options: &LoopOptions,
) -> Result<LoopStats> {
    run_capture_loop_observed(source, classifier, session, forwarder, stop, options, |_, _| {})
}

/// [`run_capture_loop`] with a callback after every recorded frame.
pub fn run_capture_loop_observed<F>(
    source: &mut CaptureSource,
    classifier: &Mutex<dyn EngagementClassifier>,
    session: &mut SessionHandle,
    forwarder: &Forwarder,
    stop: &AtomicBool,
    options: &LoopOptions,
    mut on_frame: F,
) -> Result<LoopStats>
where
    F: FnMut(&FrameRecord, PayloadStatus),
{
    let mut stats = LoopStats::default();

    loop {
        if stop.load(Ordering::SeqCst) {
            stats.stop_reason = StopReason::Requested;
            break;
        }
        if matches!(options.max_frames, Some(max) if stats.frames_recorded >= max) {
            stats.stop_reason = StopReason::FrameLimit;
            break;
        }

        let payload = match source.next_frame() {
            Ok(Some(payload)) => payload,
            Ok(None) if source.is_exhausted() => {
                stats.stop_reason = StopReason::SourceExhausted;
                break;
            }
            Ok(None) => {
                stats.idle_polls += 1;
                continue;
            }
            Err(err) => match err.downcast_ref::<EngagementError>() {
                Some(framing) if framing.is_recoverable_framing() => {
                    log::warn!("skipping damaged frame: {}", framing);
                    stats.framing_errors += 1;
                    continue;
                }
                _ => return Err(err.context("capture source failed")),
            },
        };

        let started = Instant::now();
        let outcome = classify_payload(classifier, &payload);
        let response_time = started.elapsed().as_secs_f64();
        match outcome.status {
            PayloadStatus::Classified => {}
            PayloadStatus::DecodeFailed => stats.decode_failures += 1,
            PayloadStatus::ClassifierFailed => stats.classifier_failures += 1,
        }

        let classification = outcome.classification;
        let record = match session.record_frame(
            &payload,
            classification.level,
            classification.confidence,
            response_time,
        ) {
            Ok(record) => record,
            Err(EngagementError::InvalidMeasurement(value)) => {
                log::warn!("dropping frame with invalid response time {}", value);
                stats.rejected_measurements += 1;
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "record frame for {}/{}",
                        session.respondent(),
                        session.session_label()
                    )
                })
            }
        };

        stats.frames_recorded += 1;
        if record.level.is_detection() {
            stats.detections += 1;
        }
        let forwarded = forwarder.submit(ResultPayload::from_record(
            session.respondent(),
            session.session_label(),
            &record,
        ));
        if forwarded {
            stats.forwarded += 1;
        }
        on_frame(&record, outcome.status);
    }

    log::info!(
        "capture loop finished ({:?}): {} frames, {} detections, {} decode failures, {} framing errors",
        stats.stop_reason,
        stats.frames_recorded,
        stats.detections,
        stats.decode_failures,
        stats.framing_errors
    );
    Ok(stats)
}

//! Student Engagement Monitor
//!
//! This crate turns a stream of camera frames into per-session engagement
//! artifacts.
//!
//! # Architecture
//!
//! Frames flow through one synchronous pipeline per session:
//!
//! 1. **Ingest**: a capture source (USB-serial ESP32, Wi-Fi ESP32-CAM, V4L2
//!    webcam, recorded capture, or synthetic stub) yields JPEG payloads.
//!    Serial links use the `AA 55 | len32le | payload` framing in [`framing`].
//! 2. **Classify**: the payload is decoded and handed to an
//!    [`EngagementClassifier`] backend. Decode failures short-circuit to
//!    "no detection" without touching the classifier.
//! 3. **Record**: the [`session::SessionHandle`] appends one CSV row per frame,
//!    files detected frames into per-level buckets, and feeds the optional
//!    video sink.
//! 4. **Forward**: results are handed to a fire-and-forget [`forward::Forwarder`]
//!    that posts them to a collector over HTTP or WebSocket.
//!
//! # Module Structure
//!
//! - `framing`: serial frame deserializer
//! - `session`: session lifecycle, results log, buckets, summaries
//! - `classify`: decode step, classifier trait, backend registry
//! - `ingest`: capture sources
//! - `pipeline`: cancellable capture loop
//! - `forward`: result forwarding to a collector
//! - `collector`: the collector service ("accept and append")
//! - `edge`: HTTP ingest for cameras that push frames instead of streaming
//! - `config`: file + environment configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub mod classify;
pub mod collector;
pub mod config;
pub mod edge;
pub mod error;
pub mod forward;
pub mod framing;
pub mod ingest;
pub mod pipeline;
pub mod session;

pub use classify::{
    classify_payload, decode_frame, Classification, ClassifierRegistry, DecodedFrame,
    EngagementClassifier, StubClassifier,
};
pub use error::EngagementError;
pub use forward::{ForwardConfig, Forwarder, ResultPayload};
pub use framing::{read_next_frame, write_frame, FrameReader, MAX_FRAME_BYTES};
pub use ingest::{CaptureSource, SourceStats};
pub use pipeline::{run_capture_loop, LoopOptions, LoopStats, StopFlag};
pub use session::{
    start_session, summarize_log, EngagementVerdict, FrameRecord, SessionHandle, SessionOptions,
    SessionSummary,
};

// -------------------- Engagement Levels --------------------

/// Classification label attached to every recorded frame.
///
/// `NoDetection` (-1) covers "no face", "decode failure" and "classifier error";
/// the four tiers are ordered by increasing engagement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum EngagementLevel {
    NoDetection,
    Level0,
    Level1,
    Level2,
    Level3,
}

impl EngagementLevel {
    /// The four detection tiers, in ascending order. Each one owns a bucket.
    pub const ALL_TIERS: [EngagementLevel; 4] = [
        EngagementLevel::Level0,
        EngagementLevel::Level1,
        EngagementLevel::Level2,
        EngagementLevel::Level3,
    ];

    pub fn from_i32(value: i32) -> Result<Self, EngagementError> {
        match value {
            -1 => Ok(Self::NoDetection),
            0 => Ok(Self::Level0),
            1 => Ok(Self::Level1),
            2 => Ok(Self::Level2),
            3 => Ok(Self::Level3),
            other => Err(EngagementError::InvalidLevel(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::NoDetection => -1,
            Self::Level0 => 0,
            Self::Level1 => 1,
            Self::Level2 => 2,
            Self::Level3 => 3,
        }
    }

    /// Index into per-tier arrays; `None` for `NoDetection`.
    pub fn tier_index(self) -> Option<usize> {
        match self {
            Self::NoDetection => None,
            other => Some(other.as_i32() as usize),
        }
    }

    /// Bucket directory name under `engagement/`.
    pub fn bucket_name(self) -> Option<&'static str> {
        match self {
            Self::NoDetection => None,
            Self::Level0 => Some("0"),
            Self::Level1 => Some("1"),
            Self::Level2 => Some("2"),
            Self::Level3 => Some("3"),
        }
    }

    pub fn is_detection(self) -> bool {
        self != Self::NoDetection
    }
}

impl TryFrom<i32> for EngagementLevel {
    type Error = EngagementError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_i32(value)
    }
}

impl From<EngagementLevel> for i32 {
    fn from(level: EngagementLevel) -> Self {
        level.as_i32()
    }
}

impl fmt::Display for EngagementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

// -------------------- Identifiers --------------------

/// Validate a caller-supplied identifier that becomes a path component.
///
/// Allowlist: 1..64 chars of `[A-Za-z0-9_.-]`, starting alphanumeric. This
/// rules out separators, `..`, and hidden names.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), EngagementError> {
    static IDENTIFIER_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = IDENTIFIER_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").unwrap());

    if !re.is_match(value) {
        return Err(EngagementError::InvalidIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trips_through_i32() {
        for raw in [-1, 0, 1, 2, 3] {
            let level = EngagementLevel::from_i32(raw).unwrap();
            assert_eq!(level.as_i32(), raw);
        }
        assert!(matches!(
            EngagementLevel::from_i32(4),
            Err(EngagementError::InvalidLevel(4))
        ));
        assert!(matches!(
            EngagementLevel::from_i32(-2),
            Err(EngagementError::InvalidLevel(-2))
        ));
    }

    #[test]
    fn no_detection_has_no_bucket() {
        assert_eq!(EngagementLevel::NoDetection.bucket_name(), None);
        assert_eq!(EngagementLevel::NoDetection.tier_index(), None);
        assert_eq!(EngagementLevel::Level2.bucket_name(), Some("2"));
        assert_eq!(EngagementLevel::Level3.tier_index(), Some(3));
    }

    #[test]
    fn identifiers_reject_path_traversal() {
        assert!(validate_identifier("respondent", "alice_01").is_ok());
        assert!(validate_identifier("session", "2024-05-01").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "a\\b", "../etc", "x y", "a,b"] {
            assert!(
                validate_identifier("respondent", bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
        let long = "a".repeat(65);
        assert!(validate_identifier("respondent", &long).is_err());
    }

    #[test]
    fn level_serializes_as_integer() {
        let json = serde_json::to_string(&EngagementLevel::Level2).unwrap();
        assert_eq!(json, "2");
        let level: EngagementLevel = serde_json::from_str("-1").unwrap();
        assert_eq!(level, EngagementLevel::NoDetection);
        assert!(serde_json::from_str::<EngagementLevel>("7").is_err());
    }
}

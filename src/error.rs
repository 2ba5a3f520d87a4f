//! Domain error taxonomy.
//!
//! Transport and decode conditions (`ShortRead`, `FrameTooLarge`,
//! `DecodeFailure`) are recovered locally by the capture loop. Measurement and
//! lifecycle violations (`InvalidMeasurement`, `SessionClosed`,
//! `DirectoryConflict`) are surfaced to the caller.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngagementError {
    /// Transport closed or timed out before a declared frame was complete.
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// Declared payload length exceeds `MAX_FRAME_BYTES`.
    #[error("declared frame length {0} exceeds maximum")]
    FrameTooLarge(u32),

    /// Stream ended while scanning for a sync marker.
    #[error("stream closed")]
    StreamClosed,

    /// Payload bytes did not decode to an image.
    #[error("image decode failed: {0}")]
    DecodeFailure(String),

    /// Negative or non-finite response time.
    #[error("invalid response time measurement: {0}")]
    InvalidMeasurement(f64),

    /// Engagement level outside {-1, 0, 1, 2, 3}.
    #[error("invalid engagement level {0}")]
    InvalidLevel(i32),

    /// Identifier unusable as a path component.
    #[error("invalid {field} identifier {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    /// Operation attempted on a stopped session.
    #[error("session is closed")]
    SessionClosed,

    /// Another session holds (or crashed while holding) this session directory.
    #[error("session directory already in use: {}", .0.display())]
    DirectoryConflict(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngagementError {
    /// True for framing conditions the reader recovers from by resynchronizing.
    pub fn is_recoverable_framing(&self) -> bool {
        matches!(
            self,
            EngagementError::ShortRead { .. } | EngagementError::FrameTooLarge(_)
        )
    }
}

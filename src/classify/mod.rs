//! Decode step and classifier seam.
//!
//! Face-landmark extraction and the pretrained model live behind
//! [`EngagementClassifier`]. This module only decides *whether* the classifier
//! runs: an empty or undecodable payload short-circuits to "no detection".

mod backend;
mod backends;
mod registry;

use std::sync::Mutex;

use crate::error::EngagementError;
use crate::EngagementLevel;

pub use backend::EngagementClassifier;
pub use backends::StubClassifier;
pub use registry::{ClassifierRegistry, SharedClassifier};

/// Classifier output for one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Classification {
    pub level: EngagementLevel,
    /// Probability of `level`, in [0, 1]. 0.0 for `NoDetection`.
    pub confidence: f32,
}

impl Classification {
    pub fn new(level: EngagementLevel, confidence: f32) -> Self {
        Self { level, confidence }
    }

    pub fn no_detection() -> Self {
        Self {
            level: EngagementLevel::NoDetection,
            confidence: 0.0,
        }
    }
}

/// A decoded RGB8 frame. Pixels are read-only for classifiers.
pub struct DecodedFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl DecodedFrame {
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, EngagementError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3));
        if expected != Some(pixels.len()) {
            return Err(EngagementError::DecodeFailure(format!(
                "rgb buffer of {} bytes does not match {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Decode an encoded image (JPEG from every built-in source).
pub fn decode_frame(payload: &[u8]) -> Result<DecodedFrame, EngagementError> {
    if payload.is_empty() {
        return Err(EngagementError::DecodeFailure("empty payload".to_string()));
    }
    let image = image::load_from_memory(payload)
        .map_err(|err| EngagementError::DecodeFailure(err.to_string()))?;
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    DecodedFrame::from_rgb(width, height, rgb.into_raw())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadStatus {
    Classified,
    DecodeFailed,
    ClassifierFailed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassifiedPayload {
    pub classification: Classification,
    pub status: PayloadStatus,
}

/// Decode `payload` and run the classifier on it.
///
/// Never fails: decode failures skip the classifier entirely, and classifier
/// errors (or a poisoned backend lock) are logged. Both map to
/// `Classification::no_detection()`. The lock is held for the `classify` call
/// only.
pub fn classify_payload(
    classifier: &Mutex<dyn EngagementClassifier>,
    payload: &[u8],
) -> ClassifiedPayload {
    let frame = match decode_frame(payload) {
        Ok(frame) => frame,
        Err(err) => {
            log::warn!("frame dropped to no-detection: {}", err);
            return ClassifiedPayload {
                classification: Classification::no_detection(),
                status: PayloadStatus::DecodeFailed,
            };
        }
    };

    let result = match classifier.lock() {
        Ok(mut backend) => backend.classify(&frame),
        Err(_) => Err(anyhow::anyhow!("classifier lock poisoned")),
    };
    match result {
        Ok(classification) => ClassifiedPayload {
            classification: sanitize(classification),
            status: PayloadStatus::Classified,
        },
        Err(err) => {
            log::warn!("classifier failed, recording no-detection: {}", err);
            ClassifiedPayload {
                classification: Classification::no_detection(),
                status: PayloadStatus::ClassifierFailed,
            }
        }
    }
}

fn sanitize(classification: Classification) -> Classification {
    if !classification.level.is_detection() {
        return Classification::no_detection();
    }
    let confidence = if classification.confidence.is_finite() {
        classification.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Classification::new(classification.level, confidence)
}

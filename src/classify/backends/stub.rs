use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::classify::backend::EngagementClassifier;
use crate::classify::{Classification, DecodedFrame};
use crate::EngagementLevel;

/// Stub backend for testing and demos.
///
/// Derives a level from a hash of the pixels: identical frames always get the
/// same answer, and roughly one frame in five is reported as "no face".
#[derive(Default)]
pub struct StubClassifier {
    frames_seen: u64,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl EngagementClassifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, frame: &DecodedFrame) -> Result<Classification> {
        self.frames_seen += 1;
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let raw_level = (digest[0] % 5) as i32 - 1;
        let level = EngagementLevel::from_i32(raw_level)?;
        if !level.is_detection() {
            return Ok(Classification::no_detection());
        }
        let confidence = 0.5 + (digest[1] as f32 / 255.0) * 0.5;
        Ok(Classification::new(level, confidence))
    }
}

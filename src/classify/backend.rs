use anyhow::Result;

use super::{Classification, DecodedFrame};

/// Engagement classifier backend.
///
/// Backends wrap the landmark extractor and the pretrained model. They see a
/// decoded frame only for the duration of `classify` and return a level plus
/// the model's confidence for it.
///
/// Implementations must not panic on frames that decoded successfully; return
/// an error or `Classification::no_detection()` instead.
pub trait EngagementClassifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn classify(&mut self, frame: &DecodedFrame) -> Result<Classification>;

    /// Optional warm-up hook (model load, first inference).
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

use anyhow::Result;

use crate::frame::{Detection, Frame};

/// Inference backend trait.
///
/// Backends run on a dedicated worker thread and every call is bounded by the
/// inference timeout. A call that overruns is abandoned, so implementations must
/// not assume the caller observed their result.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &str;

    /// Run detection on a frame, keeping results at or above `confidence_threshold`.
    ///
    /// Boxes may be expressed in pixels of `frame` or normalized to it.
    fn infer(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop caches that can be rebuilt.
    fn reclaim(&mut self) -> Result<()> {
        Ok(())
    }
}

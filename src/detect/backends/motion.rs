use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::InferenceBackend;
use crate::frame::{BoundingBox, Detection, Frame, Region};

const MOTION_CONFIDENCE: f32 = 0.85;

/// Frame-difference detector. Reports one whole-frame `motion` detection when the
/// pixels changed since the previous call.
#[derive(Default)]
pub struct MotionBackend {
    last_hash: Option<[u8; 32]>,
}

impl MotionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InferenceBackend for MotionBackend {
    fn name(&self) -> &str {
        "motion"
    }

    fn infer(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        if motion && MOTION_CONFIDENCE >= confidence_threshold {
            Ok(vec![Detection::new(
                "motion",
                MOTION_CONFIDENCE,
                Region::Normalized(BoundingBox::new(0.0, 0.0, 1.0, 1.0)),
            )])
        } else {
            Ok(Vec::new())
        }
    }

    fn reclaim(&mut self) -> Result<()> {
        self.last_hash = None;
        Ok(())
    }
}

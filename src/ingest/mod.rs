//! Frame acquisition.
//!
//! This module provides:
//! - The acquisition collaborator contract (`CameraBackend`, `CaptureHandle`)
//! - `CaptureStage`: a worker thread that prefetches exactly one frame ahead
//! - `SourceProber`: background re-probe of failed sources
//! - `SyntheticCamera`: `stub://` sources for tests and fault drills
//! - `StillsCamera`: local directories of still images
//! - `LocatorCamera`: picks one of the above from the source locator
//!
//! The acquisition layer MUST NOT:
//! - Retain frames beyond handoff to the loop
//! - Decide which source is active (that is `SourceSelector`'s job)

use anyhow::Result;
use serde::Deserialize;

use crate::frame::Frame;
use crate::source::SourceDescriptor;

pub mod capture;
pub mod prober;
pub mod stills;
pub mod synthetic;

pub use capture::{CaptureOutcome, CaptureStage, Captured};
pub use prober::SourceProber;
pub use stills::StillsCamera;
pub use synthetic::{StubOptions, SyntheticCamera};

/// Resolution and rate requested from a source.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
        }
    }
}

/// Opens sources. Shared by the capture worker and the prober.
pub trait CameraBackend: Send + Sync {
    fn open(
        &self,
        source: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>>;
}

/// An open source.
pub trait CaptureHandle: Send {
    /// Next frame. `Ok(None)` means the source had no frame (Unavailable).
    ///
    /// Errors wrapping [`crate::ResourceExhausted`] are classified as resource
    /// failures, anything else as capture failures.
    fn capture(&mut self) -> Result<Option<Frame>>;

    fn close(&mut self) {}

    /// Free buffers that can be rebuilt on demand.
    fn reclaim(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Dispatches on the locator: `stub://` to [`SyntheticCamera`], everything else to
/// [`StillsCamera`].
#[derive(Clone, Debug, Default)]
pub struct LocatorCamera {
    synthetic: SyntheticCamera,
    stills: StillsCamera,
}

impl LocatorCamera {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CameraBackend for LocatorCamera {
    fn open(
        &self,
        source: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        if source.locator.starts_with(synthetic::STUB_SCHEME) {
            self.synthetic.open(source, settings)
        } else {
            self.stills.open(source, settings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;

    #[test]
    fn locator_camera_routes_by_scheme() {
        let camera = LocatorCamera::new();
        let settings = CaptureSettings {
            width: 4,
            height: 4,
            fps: 1000.0,
        };
        let stub = SourceDescriptor::new("a", "stub://a", 0, SourceKind::Primary);
        assert!(camera.open(&stub, &settings).is_ok());
        let remote = SourceDescriptor::new("b", "rtsp://camera/stream", 1, SourceKind::Fallback);
        assert!(camera.open(&remote, &settings).is_err());
    }
}

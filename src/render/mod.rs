//! Presentation collaborators.

use anyhow::Result;

use crate::frame::{Detection, Frame};
use crate::recovery::RecoveryState;

mod console;

pub use console::ConsoleRenderer;

/// Operator input collected by the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Quit,
    SwitchSource,
    ToggleFullscreen,
    None,
}

/// Status drawn alongside the frame.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayMeta {
    pub cycle: u64,
    pub fps: f64,
    pub target_fps: f64,
    pub source_id: String,
    pub state: RecoveryState,
    pub detection_enabled: bool,
    /// Whether detection ran on this frame.
    pub detection_ran: bool,
    pub target_scale: f64,
}

pub trait Renderer: Send {
    /// Draw `frame` with `detections`. An error means the surface is unavailable.
    fn present(&mut self, frame: &Frame, detections: &[Detection], meta: &OverlayMeta) -> Result<()>;

    /// Non-blocking. Called right after each successful present.
    fn poll_input(&mut self) -> Command {
        Command::None
    }

    fn toggle_fullscreen(&mut self) {}

    /// Tear down and recreate the presentation surface.
    fn restart(&mut self) -> Result<()>;

    /// Release the surface for good.
    fn release(&mut self);

    fn reclaim(&mut self) -> Result<()> {
        Ok(())
    }
}

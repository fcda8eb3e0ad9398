use anyhow::{anyhow, Result};
use std::io::Read;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use super::{Command, OverlayMeta, Renderer};
use crate::frame::{Detection, Frame, Region};

const STATUS_EVERY: Duration = Duration::from_secs(1);

const ESC: u8 = 0x1b;

/// Headless presenter. Logs a status line once per second and detections at
/// debug level. In interactive mode it reads single keys from stdin:
/// `q`/Esc quit, `c` switch source, `f` toggle fullscreen.
pub struct ConsoleRenderer {
    keys: Option<Receiver<u8>>,
    interactive: bool,
    fullscreen: bool,
    released: bool,
    presented: u64,
    last_status: Option<Instant>,
}

impl ConsoleRenderer {
    pub fn new(interactive: bool) -> Self {
        Self {
            keys: interactive.then(spawn_key_reader),
            interactive,
            fullscreen: false,
            released: false,
            presented: 0,
            last_status: None,
        }
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

/// Stdin is blocking, so keys are read on a detached thread. It ends with stdin.
fn spawn_key_reader() -> Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("vigil-keys".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for byte in stdin.lock().bytes() {
                let Ok(byte) = byte else { break };
                if tx.send(byte).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        log::warn!("keyboard input unavailable: {}", err);
    }
    rx
}

fn describe(detection: &Detection) -> String {
    let (kind, b) = match detection.region {
        Region::Normalized(b) => ("norm", b),
        Region::Pixel(b) => ("px", b),
    };
    format!(
        "{} {:.2} [{} {:.2},{:.2} {:.2}x{:.2}]",
        detection.class_label,
        detection.confidence,
        kind,
        b.x1,
        b.y1,
        b.width(),
        b.height()
    )
}

impl Renderer for ConsoleRenderer {
    fn present(&mut self, frame: &Frame, detections: &[Detection], meta: &OverlayMeta) -> Result<()> {
        if self.released {
            return Err(anyhow!("console renderer already released"));
        }
        self.presented += 1;
        for detection in detections {
            log::debug!("frame {}: {}", frame.sequence, describe(detection));
        }
        let due = self
            .last_status
            .map_or(true, |at| at.elapsed() >= STATUS_EVERY);
        if due {
            self.last_status = Some(Instant::now());
            log::info!(
                "[{}] {}x{} fps={:.1}/{:.0} detections={} detect={} scale={:.2} state={}{}",
                meta.source_id,
                frame.width,
                frame.height,
                meta.fps,
                meta.target_fps,
                detections.len(),
                if !meta.detection_enabled {
                    "off"
                } else if meta.detection_ran {
                    "on"
                } else {
                    "skipped"
                },
                meta.target_scale,
                meta.state,
                if self.fullscreen { " fullscreen" } else { "" }
            );
        }
        Ok(())
    }

    fn poll_input(&mut self) -> Command {
        let Some(keys) = self.keys.as_ref() else {
            return Command::None;
        };
        loop {
            match keys.try_recv() {
                Ok(b'q') | Ok(b'Q') | Ok(ESC) => return Command::Quit,
                Ok(b'c') | Ok(b'C') => return Command::SwitchSource,
                Ok(b'f') | Ok(b'F') => return Command::ToggleFullscreen,
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return Command::None,
                Err(TryRecvError::Disconnected) => {
                    self.keys = None;
                    return Command::None;
                }
            }
        }
    }

    fn toggle_fullscreen(&mut self) {
        self.fullscreen = !self.fullscreen;
        log::info!("fullscreen {}", if self.fullscreen { "on" } else { "off" });
    }

    fn restart(&mut self) -> Result<()> {
        self.released = false;
        self.last_status = None;
        if self.interactive && self.keys.is_none() {
            self.keys = Some(spawn_key_reader());
        }
        log::info!("console renderer restarted");
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
        self.keys = None;
        log::info!("console renderer released after {} frames", self.presented);
    }
}

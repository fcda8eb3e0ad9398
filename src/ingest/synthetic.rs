//! Synthetic `stub://` sources.
//!
//! Produces a moving RGB pattern with a scene change every 50 frames. Query
//! options inject faults for drills and tests:
//!
//! - `fail_every=N`: every Nth capture returns no frame
//! - `fail_after=N`: no frame at all after the first N captures of one open
//! - `offline`: opening the source fails
//!
//! e.g. `stub://front?fail_every=7` or `stub://drone?fail_after=100`.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::{CameraBackend, CaptureHandle, CaptureSettings};
use crate::frame::{Frame, BYTES_PER_PIXEL};
use crate::source::SourceDescriptor;

pub const STUB_SCHEME: &str = "stub://";

const SCENE_CHANGE_EVERY: u64 = 50;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StubOptions {
    pub name: String,
    pub fail_every: Option<u64>,
    pub fail_after: Option<u64>,
    pub offline: bool,
}

impl StubOptions {
    pub fn parse(locator: &str) -> Result<Self> {
        let rest = locator
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| anyhow!("'{}' is not a {} locator", locator, STUB_SCHEME))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        let mut options = StubOptions {
            name: name.to_string(),
            ..StubOptions::default()
        };
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "fail_every" => options.fail_every = Some(parse_count(key, value)?),
                "fail_after" => options.fail_after = Some(parse_count(key, value)?),
                "offline" => options.offline = true,
                other => return Err(anyhow!("unknown stub option '{}'", other)),
            }
        }
        Ok(options)
    }
}

fn parse_count(key: &str, value: &str) -> Result<u64> {
    let n: u64 = value
        .parse()
        .with_context(|| format!("stub option {} expects a number, got '{}'", key, value))?;
    if n == 0 {
        return Err(anyhow!("stub option {} must be positive", key));
    }
    Ok(n)
}

/// Camera backend for `stub://` locators.
#[derive(Clone, Debug)]
pub struct SyntheticCamera {
    paced: bool,
}

impl SyntheticCamera {
    /// Frames are delivered no faster than the configured rate.
    pub fn new() -> Self {
        Self { paced: true }
    }

    /// Frames are delivered as fast as they can be generated.
    pub fn unpaced() -> Self {
        Self { paced: false }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for SyntheticCamera {
    fn open(
        &self,
        source: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        let options = StubOptions::parse(&source.locator)?;
        if options.offline {
            return Err(anyhow!("{} is offline", source.locator));
        }
        if settings.width == 0 || settings.height == 0 {
            return Err(anyhow!(
                "invalid capture size {}x{}",
                settings.width,
                settings.height
            ));
        }
        log::info!("SyntheticCamera: opened {} ({})", source.id, source.locator);
        let interval = (self.paced && settings.fps > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / settings.fps));
        Ok(Box::new(SyntheticHandle {
            source_id: source.id.clone(),
            options,
            width: settings.width,
            height: settings.height,
            interval,
            last_capture: None,
            frame_count: 0,
            scene_state: 0,
        }))
    }
}

struct SyntheticHandle {
    source_id: String,
    options: StubOptions,
    width: u32,
    height: u32,
    interval: Option<Duration>,
    last_capture: Option<Instant>,
    frame_count: u64,
    /// Simulated scene, bumped periodically to produce motion.
    scene_state: u8,
}

impl SyntheticHandle {
    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_capture) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_capture = Some(Instant::now());
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
        if self.frame_count % SCENE_CHANGE_EVERY == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let offset = self.frame_count + u64::from(self.scene_state) * 17;
        (0..pixel_count)
            .map(|i| ((i as u64 + offset) % 256) as u8)
            .collect()
    }
}

impl CaptureHandle for SyntheticHandle {
    fn capture(&mut self) -> Result<Option<Frame>> {
        self.pace();
        self.frame_count += 1;
        let n = self.frame_count;
        if self.options.fail_after.is_some_and(|limit| n > limit) {
            return Ok(None);
        }
        if self.options.fail_every.is_some_and(|every| n % every == 0) {
            return Ok(None);
        }
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.width, self.height, &self.source_id, n).map(Some)
    }

    fn close(&mut self) {
        log::info!(
            "SyntheticCamera: closed {} after {} captures",
            self.source_id,
            self.frame_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 16,
            height: 8,
            fps: 1000.0,
        }
    }

    fn open(locator: &str) -> Result<Box<dyn CaptureHandle>> {
        let source = SourceDescriptor::new("cam", locator, 0, SourceKind::Primary);
        SyntheticCamera::unpaced().open(&source, &settings())
    }

    #[test]
    fn parses_options() -> Result<()> {
        let options = StubOptions::parse("stub://front?fail_every=3&offline")?;
        assert_eq!(options.name, "front");
        assert_eq!(options.fail_every, Some(3));
        assert!(options.offline);
        assert!(StubOptions::parse("stub://x?fail_every=0").is_err());
        assert!(StubOptions::parse("stub://x?bogus=1").is_err());
        assert!(StubOptions::parse("rtsp://x").is_err());
        Ok(())
    }

    #[test]
    fn produces_frames_of_configured_size() -> Result<()> {
        let mut handle = open("stub://front")?;
        let frame = handle.capture()?.expect("frame");
        assert_eq!(frame.dimensions(), (16, 8));
        assert_eq!(&*frame.source_id, "cam");
        let next = handle.capture()?.expect("frame");
        assert_ne!(frame.pixels(), next.pixels());
        Ok(())
    }

    #[test]
    fn fail_every_drops_periodic_frames() -> Result<()> {
        let mut handle = open("stub://front?fail_every=3")?;
        let got: Vec<bool> = (0..6)
            .map(|_| handle.capture().map(|f| f.is_some()))
            .collect::<Result<_>>()?;
        assert_eq!(got, vec![true, true, false, true, true, false]);
        Ok(())
    }

    #[test]
    fn fail_after_goes_dark() -> Result<()> {
        let mut handle = open("stub://front?fail_after=2")?;
        assert!(handle.capture()?.is_some());
        assert!(handle.capture()?.is_some());
        assert!(handle.capture()?.is_none());
        assert!(handle.capture()?.is_none());
        Ok(())
    }

    #[test]
    fn offline_source_fails_to_open() {
        assert!(open("stub://front?offline").is_err());
    }
}

//! Local still-image sequences.
//!
//! A `file://` locator (or a bare path) names a directory of PNG/JPEG images.
//! Images are played back in file-name order, looping, at the configured rate and
//! resized to the configured resolution. Decoded frames are cached per handle;
//! `reclaim` drops the cache.
//!
//! Only local paths are accepted. A file that disappears between listing and
//! decoding yields an Unavailable capture, not an error.

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{CameraBackend, CaptureHandle, CaptureSettings};
use crate::frame::Frame;
use crate::source::SourceDescriptor;

pub const FILE_SCHEME: &str = "file://";

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Decoded frames kept per handle before the cache stops growing.
const MAX_CACHED_FRAMES: usize = 64;

#[derive(Clone, Debug)]
pub struct StillsCamera {
    paced: bool,
}

impl StillsCamera {
    pub fn new() -> Self {
        Self { paced: true }
    }

    pub fn unpaced() -> Self {
        Self { paced: false }
    }
}

impl Default for StillsCamera {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory named by a `file://` locator or a plain local path.
pub fn local_dir(locator: &str) -> Result<PathBuf> {
    let path = locator.strip_prefix(FILE_SCHEME).unwrap_or(locator);
    if path.is_empty() || path.contains("://") {
        return Err(anyhow!(
            "still-image sources only support local paths, got '{}'",
            locator
        ));
    }
    Ok(PathBuf::from(path))
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });
        if is_image && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

impl CameraBackend for StillsCamera {
    fn open(
        &self,
        source: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        let dir = local_dir(&source.locator)?;
        let paths = list_images(&dir)?;
        if paths.is_empty() {
            return Err(anyhow!("no PNG or JPEG images in {}", dir.display()));
        }
        log::info!(
            "StillsCamera: opened {} ({} images in {})",
            source.id,
            paths.len(),
            dir.display()
        );
        let interval = (self.paced && settings.fps > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / settings.fps));
        Ok(Box::new(StillsHandle {
            source_id: source.id.clone(),
            cache: vec![None; paths.len()],
            paths,
            width: settings.width,
            height: settings.height,
            interval,
            last_capture: None,
            position: 0,
            sequence: 0,
        }))
    }
}

struct StillsHandle {
    source_id: String,
    paths: Vec<PathBuf>,
    cache: Vec<Option<Frame>>,
    width: u32,
    height: u32,
    interval: Option<Duration>,
    last_capture: Option<Instant>,
    position: usize,
    sequence: u64,
}

impl StillsHandle {
    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_capture) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_capture = Some(Instant::now());
    }

    fn decode(&self, path: &Path) -> Result<Option<Frame>> {
        let image = match image::open(path) {
            Ok(image) => image,
            Err(image::ImageError::IoError(err)) if err.kind() == ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to decode {}", path.display()))
            }
        };
        let mut rgb = image.to_rgb8();
        if rgb.dimensions() != (self.width, self.height) {
            rgb = imageops::resize(&rgb, self.width, self.height, FilterType::Triangle);
        }
        Frame::new(rgb.into_raw(), self.width, self.height, &self.source_id, 0).map(Some)
    }
}

impl CaptureHandle for StillsHandle {
    fn capture(&mut self) -> Result<Option<Frame>> {
        self.pace();
        let idx = self.position;
        self.position = (self.position + 1) % self.paths.len();

        let cached = self.cache[idx].clone();
        let frame = match cached {
            Some(frame) => frame,
            None => {
                let Some(frame) = self.decode(&self.paths[idx])? else {
                    return Ok(None);
                };
                if self.cache.iter().flatten().count() < MAX_CACHED_FRAMES {
                    self.cache[idx] = Some(frame.clone());
                }
                frame
            }
        };
        self.sequence += 1;
        Ok(Some(frame.restamped(self.sequence)))
    }

    fn close(&mut self) {
        log::info!(
            "StillsCamera: closed {} after {} frames",
            self.source_id,
            self.sequence
        );
    }

    fn reclaim(&mut self) -> Result<()> {
        self.cache.iter_mut().for_each(|slot| *slot = None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;
    use image::{Rgb, RgbImage};

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 8,
            height: 6,
            fps: 1000.0,
        }
    }

    fn write_png(dir: &Path, name: &str, shade: u8) {
        let image = RgbImage::from_pixel(16, 12, Rgb([shade, shade, shade]));
        image.save(dir.join(name)).unwrap();
    }

    #[test]
    fn rejects_remote_locators() {
        assert!(local_dir("rtsp://camera/stream").is_err());
        assert!(local_dir("file://").is_err());
        assert_eq!(
            local_dir("file:///var/lib/vigil/frames").unwrap(),
            PathBuf::from("/var/lib/vigil/frames")
        );
    }

    #[test]
    fn plays_images_in_order_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 200);
        write_png(dir.path(), "a.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let locator = format!("file://{}", dir.path().display());
        let source = SourceDescriptor::new("stills", &locator, 0, SourceKind::Primary);
        let mut handle = StillsCamera::unpaced().open(&source, &settings()).unwrap();

        let first = handle.capture().unwrap().expect("frame");
        assert_eq!(first.dimensions(), (8, 6));
        assert_eq!(first.pixels()[0], 10);
        let second = handle.capture().unwrap().expect("frame");
        assert_eq!(second.pixels()[0], 200);
        let third = handle.capture().unwrap().expect("frame");
        assert_eq!(third.pixels()[0], 10);
        assert_eq!(third.sequence, 3);
        handle.reclaim().unwrap();
        assert!(handle.capture().unwrap().is_some());
    }

    #[test]
    fn empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let source = SourceDescriptor::new(
            "stills",
            &dir.path().display().to_string(),
            0,
            SourceKind::Primary,
        );
        assert!(StillsCamera::unpaced().open(&source, &settings()).is_err());
    }
}

//! Frames and detections.
//!
//! - `Frame`: owned, immutable RGB24 buffer tagged with size, capture instant and source.
//!   Pixels live behind an `Arc` so the inference and render stages can share one
//!   capture without copying.
//! - `Detection`: one result from the inference collaborator.
//! - `map_to_frame`: maps boxes reported against a down-scaled frame back onto the
//!   presented frame.
//!
//! Frames are discarded at the end of the cycle that captured them. Nothing in the
//! loop retains pixel data across cycles.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bytes per pixel. All collaborators exchange RGB24.
pub const BYTES_PER_PIXEL: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant.
    pub captured_at: Instant,
    /// Id of the source descriptor this frame came from.
    pub source_id: Arc<str>,
    /// Per-source capture counter.
    pub sequence: u64,
}

impl Frame {
    /// Create a frame from an RGB24 buffer. The buffer length must match the dimensions.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        source_id: &str,
        sequence: u64,
    ) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            captured_at: Instant::now(),
            source_id: Arc::from(source_id),
            sequence,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The same pixels, stamped as a fresh capture with `sequence`.
    pub fn restamped(&self, sequence: u64) -> Frame {
        Frame {
            captured_at: Instant::now(),
            sequence,
            ..self.clone()
        }
    }

    /// Resample to exactly `width` x `height`.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize frame to {}x{}", width, height));
        }
        if (width, height) == self.dimensions() {
            return Ok(self.clone());
        }
        let image = RgbImage::from_raw(self.width, self.height, self.pixels.to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        let scaled = imageops::resize(&image, width, height, FilterType::Triangle);
        Ok(Frame {
            pixels: scaled.into_raw().into(),
            width,
            height,
            captured_at: self.captured_at,
            source_id: self.source_id.clone(),
            sequence: self.sequence,
        })
    }

    /// Down-sample by `scale` in both dimensions. Scales at or above 1.0 return
    /// the frame unchanged (sharing the same pixel buffer).
    pub fn downscaled(&self, scale: f64) -> Result<Frame> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(anyhow!("invalid down-scale factor {}", scale));
        }
        if scale >= 1.0 {
            return Ok(self.clone());
        }
        let width = ((self.width as f64 * scale).round() as u32).max(1);
        let height = ((self.height as f64 * scale).round() as u32).max(1);
        self.resized(width, height)
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(BYTES_PER_PIXEL))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// Detections
// ----------------------------------------------------------------------------

/// Axis-aligned box, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

/// Where a box is expressed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Region {
    /// 0..1 relative to the frame the detector saw; size independent.
    Normalized(BoundingBox),
    /// Pixels of the frame the detector saw.
    Pixel(BoundingBox),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_label: String,
    /// In [0, 1].
    pub confidence: f32,
    pub region: Region,
}

impl Detection {
    pub fn new(class_label: impl Into<String>, confidence: f32, region: Region) -> Self {
        Self {
            class_label: class_label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            region,
        }
    }
}

/// Map detections reported against a frame of size `from` onto a frame of size `to`.
///
/// Normalized boxes are size independent and pass through. Pixel boxes are scaled
/// per axis and clamped to the target frame.
pub fn map_to_frame(detections: Vec<Detection>, from: (u32, u32), to: (u32, u32)) -> Vec<Detection> {
    if from == to || from.0 == 0 || from.1 == 0 {
        return detections;
    }
    let sx = to.0 as f32 / from.0 as f32;
    let sy = to.1 as f32 / from.1 as f32;
    let (max_x, max_y) = (to.0 as f32, to.1 as f32);
    detections
        .into_iter()
        .map(|mut det| {
            if let Region::Pixel(b) = det.region {
                det.region = Region::Pixel(BoundingBox {
                    x1: (b.x1 * sx).clamp(0.0, max_x),
                    y1: (b.y1 * sy).clamp(0.0, max_y),
                    x2: (b.x2 * sx).clamp(0.0, max_x),
                    y2: (b.y2 * sy).clamp(0.0, max_y),
                });
            }
            det
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(width: u32, height: u32) -> Frame {
        let pixels = vec![128u8; width as usize * height as usize * BYTES_PER_PIXEL];
        Frame::new(pixels, width, height, "cam", 1).unwrap()
    }

    #[test]
    fn frame_rejects_length_mismatch() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, "cam", 0).is_err());
    }

    #[test]
    fn downscale_halves_dimensions() {
        let frame = make_test_frame(64, 48);
        let small = frame.downscaled(0.5).unwrap();
        assert_eq!(small.dimensions(), (32, 24));
        assert_eq!(small.byte_len(), 32 * 24 * BYTES_PER_PIXEL);
        assert_eq!(&*small.source_id, "cam");
        assert_eq!(small.pixels()[0], 128);
    }

    #[test]
    fn downscale_at_full_scale_shares_buffer() {
        let frame = make_test_frame(8, 8);
        let same = frame.downscaled(1.0).unwrap();
        assert!(Arc::ptr_eq(&frame.pixels, &same.pixels));
        assert!(frame.downscaled(0.0).is_err());
    }

    #[test]
    fn pixel_boxes_map_back_to_presented_frame() {
        let dets = vec![
            Detection::new(
                "person",
                0.9,
                Region::Pixel(BoundingBox::new(10.0, 10.0, 20.0, 30.0)),
            ),
            Detection::new(
                "motion",
                0.8,
                Region::Normalized(BoundingBox::new(0.1, 0.1, 0.5, 0.5)),
            ),
        ];
        let mapped = map_to_frame(dets, (320, 240), (640, 480));
        assert_eq!(
            mapped[0].region,
            Region::Pixel(BoundingBox::new(20.0, 20.0, 40.0, 60.0))
        );
        assert_eq!(
            mapped[1].region,
            Region::Normalized(BoundingBox::new(0.1, 0.1, 0.5, 0.5))
        );
    }

    #[test]
    fn detection_confidence_is_clamped() {
        let det = Detection::new("x", 1.7, Region::Normalized(BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(det.confidence, 1.0);
    }
}

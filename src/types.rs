//! Core data types for facelive-rs
//!
//! Geometry and per-face metadata carried inside pipeline envelopes.
//! Pixel buffers themselves never live here; they sit in the
//! [`WeakHeap`](crate::heap::WeakHeap) and are referenced by name.
//!
//! # Main Types
//!
//! - [`FrameSize`] - Dimensions of a raw interleaved 8-bit frame
//! - [`FaceRect`] - Axis-aligned face rectangle in frame pixels
//! - [`Landmarks`] - Ordered facial landmark points
//! - [`FacePose`] - Head orientation in degrees
//! - [`FaceRecord`] - Everything the pipeline knows about one detected face

use serde::{Deserialize, Serialize};

/// Dimensions of a raw interleaved 8-bit image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel (1 = grey, 3 = RGB).
    pub channels: u8,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32, channels: u8) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Expected buffer length for an image of this size.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.channels == 0
    }
}

/// Face rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Distance of the rectangle centre from a point.
    pub fn distance_to(&self, point: (f32, f32)) -> f32 {
        let (cx, cy) = self.center();
        ((cx - point.0).powi(2) + (cy - point.1).powi(2)).sqrt()
    }

    /// Scale around the centre by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        let (cx, cy) = self.center();
        let w = self.width * factor;
        let h = self.height * factor;
        Self::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }

    /// Clip to `[0, width) x [0, height)`. Returns `None` if nothing remains.
    pub fn clipped(&self, size: FrameSize) -> Option<Self> {
        let x0 = self.x.max(0.0);
        let y0 = self.y.max(0.0);
        let x1 = (self.x + self.width).min(size.width as f32);
        let y1 = (self.y + self.height).min(size.height as f32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Ordered landmark points in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmarks {
    pub points: Vec<(f32, f32)>,
}

impl Landmarks {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Bounding rectangle of all points.
    pub fn bounds(&self) -> Option<FaceRect> {
        let first = self.points.first()?;
        let (mut x0, mut y0, mut x1, mut y1) = (first.0, first.1, first.0, first.1);
        for &(x, y) in &self.points[1..] {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        Some(FaceRect::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FacePose {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

/// Per-face metadata. Image fields hold envelope image keys, not pixels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceRecord {
    pub rect: Option<FaceRect>,
    pub landmarks: Option<Landmarks>,
    pub pose: Option<FacePose>,
    pub align_image_name: Option<String>,
    pub align_mask_name: Option<String>,
    pub swap_image_name: Option<String>,
    pub swap_mask_name: Option<String>,
}

impl FaceRecord {
    pub fn from_rect(rect: FaceRect) -> Self {
        Self {
            rect: Some(rect),
            ..Default::default()
        }
    }
}

/// Envelope key of the aligned face image for face `idx`.
pub fn align_key(idx: usize) -> String {
    format!("face{}_align", idx)
}

/// Envelope key of the aligned face mask for face `idx`.
pub fn align_mask_key(idx: usize) -> String {
    format!("face{}_align_mask", idx)
}

/// Envelope key of the swapped face image for face `idx`.
pub fn swap_key(idx: usize) -> String {
    format!("face{}_swap", idx)
}

/// Envelope key of the swapped face mask for face `idx`.
pub fn swap_mask_key(idx: usize) -> String {
    format!("face{}_swap_mask", idx)
}

/// Envelope key of the captured source frame.
pub const FRAME_KEY: &str = "frame";

/// Envelope key of the merged output frame.
pub const MERGED_KEY: &str = "merged";

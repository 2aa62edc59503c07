use std::collections::BTreeMap;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Build a box from floating point corners, rounding to whole pixels.
    /// Negative coordinates are clipped to zero. Returns `None` for empty boxes.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<Self> {
        if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
            return None;
        }
        let (x1, x2) = if x2 < x1 { (x2, x1) } else { (x1, x2) };
        let (y1, y2) = if y2 < y1 { (y2, y1) } else { (y1, y2) };

        let left = x1.max(0.0).round() as u32;
        let top = y1.max(0.0).round() as u32;
        let right = x2.max(0.0).round() as u32;
        let bottom = y2.max(0.0).round() as u32;

        if right <= left || bottom <= top {
            return None;
        }
        Some(Self::new(left, top, right - left, bottom - top))
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right <= left || bottom <= top {
            return 0;
        }
        (right - left) as u64 * (bottom - top) as u64
    }

    /// Intersection over Union
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection_area(other);
        if intersection == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            return 0.0;
        }
        intersection as f32 / union as f32
    }

    /// Grow the box on every side by `ratio` of its own width/height.
    pub fn expand(&self, ratio: f32) -> BoundingBox {
        let ratio = ratio.max(0.0);
        let pad_x = (self.width as f32 * ratio).round() as u32;
        let pad_y = (self.height as f32 * ratio).round() as u32;

        let x = self.x.saturating_sub(pad_x);
        let y = self.y.saturating_sub(pad_y);
        BoundingBox {
            x,
            y,
            width: self.right().saturating_add(pad_x) - x,
            height: self.bottom().saturating_add(pad_y) - y,
        }
    }

    /// Restrict the box to an image of the given size.
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clamp(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let clamped = BoundingBox {
            x: self.x,
            y: self.y,
            width: self.right().min(width) - self.x,
            height: self.bottom().min(height) - self.y,
        };
        if clamped.is_empty() { None } else { Some(clamped) }
    }

    /// Fraction of an image of the given size covered by this box.
    pub fn area_fraction(&self, width: u32, height: u32) -> f32 {
        let total = width as u64 * height as u64;
        if total == 0 {
            return 0.0;
        }
        self.area() as f32 / total as f32
    }

    /// Extract the region as a sub-image (used for debug output)
    pub fn crop(&self, img: &DynamicImage) -> Option<DynamicImage> {
        let clamped = self.clamp(img.width(), img.height())?;
        Some(img.crop_imm(clamped.x, clamped.y, clamped.width, clamped.height))
    }
}

/// Which detector produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Text,
    Object,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::Text => "text",
            CandidateSource::Object => "object",
        }
    }
}

/// A region some detector believes contains a license plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRegion {
    pub bbox: BoundingBox,
    pub source: CandidateSource,
    pub confidence: f32,
    pub text: Option<String>,
}

impl CandidateRegion {
    pub fn text(bbox: BoundingBox, confidence: f32, text: impl Into<String>) -> Self {
        Self {
            bbox,
            source: CandidateSource::Text,
            confidence: confidence.clamp(0.0, 1.0),
            text: Some(text.into()),
        }
    }

    pub fn object(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            source: CandidateSource::Object,
            confidence: confidence.clamp(0.0, 1.0),
            text: None,
        }
    }
}

/// An accepted candidate together with the area that will actually be obfuscated.
#[derive(Debug, Clone, PartialEq)]
pub struct RedactedRegion {
    pub candidate: CandidateRegion,
    /// Margin-expanded, image-clamped box
    pub area: BoundingBox,
}

/// Final, deduplicated regions to obfuscate for one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedactionSet {
    regions: Vec<RedactedRegion>,
}

impl RedactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, region: RedactedRegion) {
        self.regions.push(region);
    }

    pub fn regions(&self) -> &[RedactedRegion] {
        &self.regions
    }

    pub fn iter(&self) -> impl Iterator<Item = &RedactedRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Outcome of one successful render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactionResult {
    pub source_image: String,
    /// Path of the artifact relative to the output base directory
    pub output_image: String,
    pub regions_redacted: usize,
    pub detector_versions: BTreeMap<String, String>,
}

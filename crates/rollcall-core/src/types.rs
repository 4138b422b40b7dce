use serde::{Deserialize, Serialize};

use crate::policy::{Calibration, Metric, Thresholds};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score for this candidate.
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Area shared with `other`, zero when the boxes are disjoint.
    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection expressed as a fraction of the smaller box's area.
    ///
    /// Unlike IoU this flags a small box sitting entirely inside a large one
    /// as a full overlap.
    pub fn overlap_ratio(&self, other: &BoundingBox) -> f32 {
        let smaller = self.area().min(other.area());
        if smaller > 0.0 {
            self.intersection_area(other) / smaller
        } else {
            0.0
        }
    }

    /// Clip the box to a `width × height` image. Landmarks are left untouched.
    pub fn clipped(&self, width: u32, height: u32) -> BoundingBox {
        let x1 = self.x.clamp(0.0, width as f32);
        let y1 = self.y.clamp(0.0, height as f32);
        let x2 = (self.x + self.width).clamp(0.0, width as f32);
        let y2 = (self.y + self.height).clamp(0.0, height as f32);
        BoundingBox {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
            ..*self
        }
    }
}

/// A face descriptor: a fixed-length vector plus the box it was taken from.
///
/// Immutable once produced. The backend id records which encoder produced
/// it; descriptors from different backends are not comparable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptor {
    vector: Vec<f32>,
    bbox: BoundingBox,
    backend: String,
}

impl Descriptor {
    pub fn new(vector: Vec<f32>, bbox: BoundingBox, backend: impl Into<String>) -> Self {
        Self {
            vector,
            bbox,
            backend: backend.into(),
        }
    }

    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Identity and calibration of an encoder backend.
///
/// Everything a matcher needs to know about descriptors from this backend:
/// their length, how to compare them, and where the confidence curve and
/// operating points sit.
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub id: String,
    pub dimension: usize,
    pub metric: Metric,
    pub calibration: Calibration,
    pub thresholds: Thresholds,
}

impl Backend {
    /// ArcFace w600k_r50: L2-normalised 512-d embeddings compared by Euclidean distance.
    ///
    /// Same-subject pairs typically land between 0.8 and 1.1, different
    /// subjects around 1.3 to 1.4.
    pub fn arcface() -> Self {
        Self {
            id: "arcface-w600k_r50".to_string(),
            dimension: 512,
            metric: Metric::Euclidean,
            calibration: Calibration {
                d_min: 0.8,
                d_max: 1.4,
            },
            thresholds: Thresholds {
                duplicate: 0.9,
                recognition: 0.5,
            },
        }
    }

    /// Raw pixel fallback: mean-centred 64×64 grayscale crops compared by cosine.
    pub fn pixel() -> Self {
        Self {
            id: "pixel-gray64".to_string(),
            dimension: crate::pixel::PIXEL_SIDE * crate::pixel::PIXEL_SIDE,
            metric: Metric::Cosine,
            calibration: Calibration {
                d_min: 0.0,
                d_max: 1.0,
            },
            thresholds: Thresholds {
                duplicate: 0.99,
                recognition: 0.75,
            },
        }
    }
}

/// A recognised face, produced by verification and never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: String,
    /// Confidence in [0, 1] derived from `distance`.
    pub confidence: f32,
    pub distance: f32,
    pub bbox: BoundingBox,
}

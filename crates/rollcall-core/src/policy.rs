//! Similarity policy: distance metric, confidence curve, and the two
//! operating points (duplicate vs. recognition).
//!
//! All threshold constants live on [`Backend`](crate::Backend) presets and
//! flow through here; call sites never compare raw distances.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distances below this are treated as the same vector submitted twice.
pub const DEFAULT_DEGENERATE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("invalid calibration: need 0 <= d_min < d_max, got d_min={d_min} d_max={d_max}")]
    InvalidCalibration { d_min: f32, d_max: f32 },
    #[error("confidence floor {0} outside [0, 1]")]
    FloorOutOfRange(f32),
    #[error("duplicate threshold ({duplicate}) must be stricter than recognition ({recognition})")]
    ThresholdOrder { duplicate: f32, recognition: f32 },
    #[error("descriptor length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Dissimilarity measure over two same-length vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Euclidean distance, for metric-learned embeddings.
    Euclidean,
    /// `1 - cosine_similarity`, for raw vectors. Zero only for parallel
    /// vectors, which for L2-normalised input means identical ones.
    Cosine,
}

impl Metric {
    fn apply(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt(),
            Metric::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_a = 0.0f32;
                let mut norm_b = 0.0f32;
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                let denom = norm_a.sqrt() * norm_b.sqrt();
                let similarity = if denom > 0.0 { dot / denom } else { 0.0 };
                (1.0 - similarity).max(0.0)
            }
        }
    }
}

/// Confidence curve endpoints: confidence is 1.0 at or below `d_min`,
/// 0.0 at or above `d_max`, linear in between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub d_min: f32,
    pub d_max: f32,
}

/// Confidence floors for the two operating points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Enrollment: a new face at or above this confidence duplicates an existing identity.
    pub duplicate: f32,
    /// Verification: a candidate at or above this confidence is accepted.
    pub recognition: f32,
}

/// Distance and derived confidence for one descriptor pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub distance: f32,
    pub confidence: f32,
}

impl Score {
    /// Higher confidence ranks first; equal confidence goes to the lower distance.
    pub fn outranks(&self, other: &Score) -> bool {
        self.confidence > other.confidence
            || (self.confidence == other.confidence && self.distance < other.distance)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityPolicy {
    metric: Metric,
    calibration: Calibration,
    thresholds: Thresholds,
    dimension: usize,
    epsilon: f32,
}

impl SimilarityPolicy {
    pub fn new(
        metric: Metric,
        calibration: Calibration,
        thresholds: Thresholds,
        dimension: usize,
    ) -> Result<Self, PolicyError> {
        let Calibration { d_min, d_max } = calibration;
        if !(d_min.is_finite() && d_max.is_finite() && d_min >= 0.0 && d_min < d_max) {
            return Err(PolicyError::InvalidCalibration { d_min, d_max });
        }
        validate_thresholds(thresholds)?;

        Ok(Self {
            metric,
            calibration,
            thresholds,
            dimension,
            epsilon: DEFAULT_DEGENERATE_EPSILON,
        })
    }

    /// Policy calibrated for `backend`, using its default operating points.
    pub fn for_backend(backend: &crate::Backend) -> Result<Self, PolicyError> {
        Self::new(
            backend.metric,
            backend.calibration,
            backend.thresholds,
            backend.dimension,
        )
    }

    /// Replace the operating points, keeping the calibration.
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Result<Self, PolicyError> {
        validate_thresholds(thresholds)?;
        self.thresholds = thresholds;
        Ok(self)
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon.max(0.0);
        self
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Distance between two descriptor vectors.
    ///
    /// Both must have the backend's dimension; anything else is an error,
    /// never a silent truncation.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32, PolicyError> {
        for v in [a, b] {
            if v.len() != self.dimension {
                return Err(PolicyError::DimensionMismatch {
                    expected: self.dimension,
                    actual: v.len(),
                });
            }
        }
        Ok(self.metric.apply(a, b))
    }

    /// Piecewise-linear confidence in [0, 1], decreasing in `distance`.
    pub fn confidence(&self, distance: f32) -> f32 {
        let Calibration { d_min, d_max } = self.calibration;
        if distance.is_nan() || distance >= d_max {
            0.0
        } else if distance <= d_min {
            1.0
        } else {
            1.0 - (distance - d_min) / (d_max - d_min)
        }
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> Result<Score, PolicyError> {
        let distance = self.distance(a, b)?;
        Ok(Score {
            distance,
            confidence: self.confidence(distance),
        })
    }

    /// True when the two vectors are effectively the same sample.
    pub fn is_degenerate(&self, score: &Score) -> bool {
        score.distance < self.epsilon
    }

    pub fn is_duplicate(&self, score: &Score) -> bool {
        score.confidence >= self.thresholds.duplicate
    }

    pub fn is_recognized(&self, score: &Score) -> bool {
        score.confidence >= self.thresholds.recognition
    }
}

fn validate_thresholds(thresholds: Thresholds) -> Result<(), PolicyError> {
    let Thresholds {
        duplicate,
        recognition,
    } = thresholds;
    for floor in [duplicate, recognition] {
        if !(0.0..=1.0).contains(&floor) {
            return Err(PolicyError::FloorOutOfRange(floor));
        }
    }
    if duplicate <= recognition {
        return Err(PolicyError::ThresholdOrder {
            duplicate,
            recognition,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SimilarityPolicy {
        SimilarityPolicy::new(
            Metric::Euclidean,
            Calibration { d_min: 0.4, d_max: 1.0 },
            Thresholds { duplicate: 0.9, recognition: 0.5 },
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_confidence_endpoints_and_interpolation() {
        let p = policy();
        assert_eq!(p.confidence(0.0), 1.0);
        assert_eq!(p.confidence(0.4), 1.0);
        assert_eq!(p.confidence(1.0), 0.0);
        assert_eq!(p.confidence(3.0), 0.0);
        assert!((p.confidence(0.7) - 0.5).abs() < 1e-6);
        assert_eq!(p.confidence(f32::NAN), 0.0);
    }

    #[test]
    fn test_confidence_is_monotonic() {
        let p = policy();
        let mut prev = f32::INFINITY;
        for i in 0..=150 {
            let c = p.confidence(i as f32 * 0.01);
            assert!(c <= prev, "confidence rose at d={}", i as f32 * 0.01);
            assert!((0.0..=1.0).contains(&c));
            prev = c;
        }
    }

    #[test]
    fn test_duplicate_implies_recognized() {
        let p = policy();
        for i in 0..=200 {
            let d = i as f32 * 0.0075;
            let score = Score { distance: d, confidence: p.confidence(d) };
            if p.is_duplicate(&score) {
                assert!(
                    p.is_recognized(&score),
                    "stricter floor accepted d={d} but looser did not"
                );
            }
        }
    }

    #[test]
    fn test_threshold_order_enforced() {
        let err = policy()
            .with_thresholds(Thresholds { duplicate: 0.5, recognition: 0.6 })
            .unwrap_err();
        assert!(matches!(err, PolicyError::ThresholdOrder { .. }));

        let err = policy()
            .with_thresholds(Thresholds { duplicate: 0.5, recognition: 0.5 })
            .unwrap_err();
        assert!(matches!(err, PolicyError::ThresholdOrder { .. }));
    }

    #[test]
    fn test_floor_out_of_range() {
        let err = policy()
            .with_thresholds(Thresholds { duplicate: 1.5, recognition: 0.5 })
            .unwrap_err();
        assert_eq!(err, PolicyError::FloorOutOfRange(1.5));
    }

    #[test]
    fn test_invalid_calibration() {
        let err = SimilarityPolicy::new(
            Metric::Euclidean,
            Calibration { d_min: 1.0, d_max: 0.5 },
            Thresholds { duplicate: 0.9, recognition: 0.5 },
            3,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidCalibration { .. }));
    }

    #[test]
    fn test_distance_rejects_length_mismatch() {
        let p = policy();
        let err = p.distance(&[1.0, 0.0, 0.0], &[1.0, 0.0]).unwrap_err();
        assert_eq!(err, PolicyError::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_euclidean_distance_symmetric() {
        let p = policy();
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        let ab = p.distance(&a, &b).unwrap();
        let ba = p.distance(&b, &a).unwrap();
        assert!((ab - 5.0).abs() < 1e-6);
        assert_eq!(ab, ba);
        assert_eq!(p.distance(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_distance() {
        let p = SimilarityPolicy::new(
            Metric::Cosine,
            Calibration { d_min: 0.0, d_max: 1.0 },
            Thresholds { duplicate: 0.99, recognition: 0.75 },
            2,
        )
        .unwrap();
        assert!(p.distance(&[1.0, 0.0], &[1.0, 0.0]).unwrap().abs() < 1e-6);
        assert!((p.distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap() - 1.0).abs() < 1e-6);
        // Opposite vectors clamp to the bottom of the confidence curve
        let score = p.score(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();
        assert!((score.distance - 2.0).abs() < 1e-6);
        assert_eq!(score.confidence, 0.0);
        // Zero vector never looks similar
        assert!((p.distance(&[0.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_guard() {
        let p = policy();
        let same = p.score(&[0.5, 0.5, 0.5], &[0.5, 0.5, 0.5]).unwrap();
        assert!(p.is_degenerate(&same));
        let close = p.score(&[0.5, 0.5, 0.5], &[0.5, 0.5, 0.51]).unwrap();
        assert!(!p.is_degenerate(&close));
    }

    #[test]
    fn test_backend_presets_validate() {
        assert!(SimilarityPolicy::for_backend(&crate::Backend::arcface()).is_ok());
        assert!(SimilarityPolicy::for_backend(&crate::Backend::pixel()).is_ok());
    }

    #[test]
    fn test_score_ranking() {
        let strong = Score { distance: 0.3, confidence: 0.9 };
        let weak = Score { distance: 0.2, confidence: 0.5 };
        let saturated_far = Score { distance: 0.3, confidence: 1.0 };
        let saturated_near = Score { distance: 0.1, confidence: 1.0 };
        assert!(strong.outranks(&weak));
        assert!(!weak.outranks(&strong));
        assert!(saturated_near.outranks(&saturated_far));
        assert!(!saturated_far.outranks(&saturated_far));
    }
}

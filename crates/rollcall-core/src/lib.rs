//! rollcall-core: face descriptors and how to compare them.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime for CPU inference, with a raw-pixel fallback
//! when the recognition model is missing. The similarity policy turns
//! descriptor distances into calibrated confidences.

pub mod alignment;
pub mod crop;
pub mod detector;
pub mod encoder;
pub mod pixel;
pub mod policy;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use encoder::{select_encoder, BackendChoice, EncoderError, FaceEncoder};
pub use policy::{Calibration, Metric, PolicyError, Score, SimilarityPolicy, Thresholds};
pub use types::{Backend, BoundingBox, Descriptor, MatchResult};

/// System-wide directory for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}

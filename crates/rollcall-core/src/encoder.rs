//! The `FaceEncoder` capability and its concrete backends.
//!
//! An encoder turns an image into zero or more descriptors. Backends are
//! chosen once at startup by [`select_encoder`] and injected; matching code
//! never branches on which one is running.

use crate::detector::{DetectorError, FaceDetector};
use crate::pixel::PixelEncoder;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Backend, BoundingBox, Descriptor};
use image::RgbImage;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Candidates smaller than this fraction of the image are noise.
pub const MIN_FACE_AREA_RATIO: f32 = 0.01;
/// Candidates larger than this fraction of the image are false positives.
pub const MAX_FACE_AREA_RATIO: f32 = 0.50;
/// Two candidates sharing more than this fraction of the smaller box are one face.
pub const MAX_FACE_OVERLAP: f32 = 0.30;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Detects faces and produces one descriptor per usable face.
pub trait FaceEncoder: Send {
    /// The backend every descriptor from this encoder belongs to.
    fn backend(&self) -> &Backend;

    /// Detect and encode all faces in `image`.
    ///
    /// A faceless or degenerate image is `Ok(vec![])`, never an error;
    /// errors are reserved for inference failures.
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, EncoderError>;
}

/// Apply the false-detection filters to raw detector output.
///
/// Boxes are clipped to the image; those outside the
/// [`MIN_FACE_AREA_RATIO`, `MAX_FACE_AREA_RATIO`] window are dropped. Of any
/// pair overlapping by more than [`MAX_FACE_OVERLAP`] of the smaller box,
/// only the higher-scoring one survives. Survivors keep detection order.
pub fn filter_candidates(
    candidates: Vec<BoundingBox>,
    width: u32,
    height: u32,
) -> Vec<BoundingBox> {
    let image_area = width as f32 * height as f32;
    if image_area <= 0.0 {
        return Vec::new();
    }

    let sized: Vec<(usize, BoundingBox)> = candidates
        .into_iter()
        .map(|b| b.clipped(width, height))
        .enumerate()
        .filter(|(_, b)| {
            let ratio = b.area() / image_area;
            (MIN_FACE_AREA_RATIO..=MAX_FACE_AREA_RATIO).contains(&ratio)
        })
        .collect();

    let mut by_score: Vec<&(usize, BoundingBox)> = sized.iter().collect();
    by_score.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));

    let mut kept: Vec<(usize, BoundingBox)> = Vec::new();
    for &(order, face) in by_score {
        if kept.iter().all(|(_, k)| k.overlap_ratio(&face) <= MAX_FACE_OVERLAP) {
            kept.push((order, face));
        }
    }

    let dropped = sized.len() - kept.len();
    if dropped > 0 {
        tracing::debug!(dropped, "suppressed overlapping face candidates");
    }

    kept.sort_by_key(|(order, _)| *order);
    kept.into_iter().map(|(_, b)| b).collect()
}

/// Accurate backend: SCRFD detection, landmark alignment, ArcFace embedding.
pub struct ArcFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    backend: Backend,
}

impl ArcFaceEncoder {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
            backend: Backend::arcface(),
        }
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn backend(&self) -> &Backend {
        &self.backend
    }

    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, EncoderError> {
        let candidates = self.detector.detect(image)?;
        let faces = filter_candidates(candidates, image.width(), image.height());

        let mut descriptors = Vec::with_capacity(faces.len());
        for face in faces {
            match self.recognizer.extract(image, &face) {
                Ok(vector) => {
                    descriptors.push(Descriptor::new(vector, face, self.backend.id.as_str()))
                }
                Err(e @ (RecognizerError::NoLandmarks | RecognizerError::DegenerateLandmarks)) => {
                    tracing::debug!(error = %e, ?face, "skipping face that cannot be aligned");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(descriptors)
    }
}

/// Which encoder backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// ArcFace when its model is present, otherwise the pixel fallback.
    #[default]
    Auto,
    ArcFace,
    Pixel,
}

impl FromStr for BackendChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "arcface" => Ok(Self::ArcFace),
            "pixel" => Ok(Self::Pixel),
            other => Err(format!(
                "unknown encoder backend '{other}' (expected auto, arcface or pixel)"
            )),
        }
    }
}

/// Build the encoder for `choice` from the models in `model_dir`.
///
/// The detector is required by every backend. With `Auto`, a missing or
/// unloadable recognition model degrades to [`PixelEncoder`] with a warning.
pub fn select_encoder(
    model_dir: &Path,
    choice: BackendChoice,
) -> Result<Box<dyn FaceEncoder>, EncoderError> {
    let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;

    let encoder: Box<dyn FaceEncoder> = match choice {
        BackendChoice::Pixel => Box::new(PixelEncoder::new(detector)),
        BackendChoice::ArcFace => {
            let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
            Box::new(ArcFaceEncoder::new(detector, recognizer))
        }
        BackendChoice::Auto => match FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE)) {
            Ok(recognizer) => Box::new(ArcFaceEncoder::new(detector, recognizer)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "recognition model unavailable; falling back to pixel encoder"
                );
                Box::new(PixelEncoder::new(detector))
            }
        },
    };

    tracing::info!(backend = %encoder.backend().id, "face encoder ready");
    Ok(encoder)
}

//! Degraded fallback encoder: raw grayscale pixels instead of a learned embedding.
//!
//! Used when the recognition model is unavailable. Far less discriminative
//! than ArcFace, so its backend preset pairs it with much stricter
//! confidence floors.

use crate::crop;
use crate::detector::FaceDetector;
use crate::encoder::{filter_candidates, EncoderError, FaceEncoder};
use crate::types::{Backend, BoundingBox, Descriptor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

pub const PIXEL_SIDE: usize = 64;

/// Grayscale pixel vector for one face, mean-centred and L2-normalised.
///
/// Returns `None` for an empty crop or a flat patch with no contrast,
/// neither of which can be compared meaningfully.
pub fn pixel_descriptor(image: &RgbImage, bbox: &BoundingBox) -> Option<Vec<f32>> {
    let region = crop::crop_region(image, bbox)?;
    let gray = DynamicImage::ImageRgb8(region).to_luma8();
    let side = PIXEL_SIDE as u32;
    let small = imageops::resize(&gray, side, side, FilterType::Triangle);

    let raw = small.into_raw();
    if raw.iter().min() == raw.iter().max() {
        return None;
    }

    let mut values: Vec<f32> = raw.into_iter().map(|p| p as f32 / 255.0).collect();
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    values.iter_mut().for_each(|v| *v -= mean);

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < 1e-6 {
        return None;
    }
    values.iter_mut().for_each(|v| *v /= norm);
    Some(values)
}

pub struct PixelEncoder {
    detector: FaceDetector,
    backend: Backend,
}

impl PixelEncoder {
    pub fn new(detector: FaceDetector) -> Self {
        Self {
            detector,
            backend: Backend::pixel(),
        }
    }
}

impl FaceEncoder for PixelEncoder {
    fn backend(&self) -> &Backend {
        &self.backend
    }

    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, EncoderError> {
        let candidates = self.detector.detect(image)?;
        let faces = filter_candidates(candidates, image.width(), image.height());

        Ok(faces
            .into_iter()
            .filter_map(|face| match pixel_descriptor(image, &face) {
                Some(vector) => Some(Descriptor::new(vector, face, self.backend.id.as_str())),
                None => {
                    tracing::debug!(?face, "pixel encoder: flat or empty crop, skipping face");
                    None
                }
            })
            .collect())
    }
}

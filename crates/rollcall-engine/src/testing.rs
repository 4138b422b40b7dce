//! Stand-ins for models, image sources and artifact stores in unit tests.
//!
//! Test images carry a tag in the red channel of their top-left pixel; the
//! stub encoder looks the tag up to decide which faces the image "contains".

use image::{Rgb, RgbImage};
use rollcall_core::detector::DetectorError;
use rollcall_core::{
    Backend, BoundingBox, Calibration, Descriptor, EncoderError, FaceEncoder, Metric, Thresholds,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::artifacts::{ArtifactError, ArtifactKind, ArtifactStore};
use crate::source::{ImageSource, SourceError};

/// Images with this tag make the stub encoder fail.
pub const FAILING_TAG: u8 = 255;

/// 3-d Euclidean backend. Confidence is `(1.0 - d) / 0.6`, so the
/// duplicate floor sits at d = 0.46 and the recognition floor at d = 0.7.
pub fn test_backend() -> Backend {
    Backend {
        id: "test-3d".to_string(),
        dimension: 3,
        metric: Metric::Euclidean,
        calibration: Calibration { d_min: 0.4, d_max: 1.0 },
        thresholds: Thresholds {
            duplicate: 0.9,
            recognition: 0.5,
        },
    }
}

pub fn tagged_image(tag: u8) -> RgbImage {
    let mut image = RgbImage::from_pixel(100, 100, Rgb([90, 90, 90]));
    image.put_pixel(0, 0, Rgb([tag, 0, 0]));
    image
}

/// A 30×30 face box at (`x`, 10) inside a 100×100 image.
pub fn face_at(x: f32) -> BoundingBox {
    sized_face(x, 30.0)
}

pub fn sized_face(x: f32, side: f32) -> BoundingBox {
    BoundingBox {
        x,
        y: 10.0,
        width: side,
        height: side,
        confidence: 0.9,
        landmarks: None,
    }
}

#[derive(Clone)]
pub struct StubEncoder {
    backend: Backend,
    faces: HashMap<u8, Vec<(Vec<f32>, BoundingBox)>>,
}

impl StubEncoder {
    pub fn new() -> Self {
        Self::with_backend(test_backend())
    }

    pub fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            faces: HashMap::new(),
        }
    }

    /// Images tagged `tag` contain one face with descriptor `vector`.
    pub fn face(self, tag: u8, vector: [f32; 3]) -> Self {
        self.faces(tag, vec![(vector, face_at(10.0))])
    }

    pub fn faces(mut self, tag: u8, faces: Vec<([f32; 3], BoundingBox)>) -> Self {
        self.faces
            .insert(tag, faces.into_iter().map(|(v, b)| (v.to_vec(), b)).collect());
        self
    }
}

impl FaceEncoder for StubEncoder {
    fn backend(&self) -> &Backend {
        &self.backend
    }

    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, EncoderError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let tag = image.get_pixel(0, 0)[0];
        if tag == FAILING_TAG {
            return Err(DetectorError::InferenceFailed("stub failure".into()).into());
        }
        Ok(self
            .faces
            .get(&tag)
            .map(|faces| {
                faces
                    .iter()
                    .map(|(v, b)| Descriptor::new(v.clone(), *b, self.backend.id.as_str()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory image source; an identity mapped to `None` fails to load.
pub struct MemorySource {
    items: Vec<(String, Option<RgbImage>)>,
}

impl MemorySource {
    pub fn new(items: Vec<(&str, Option<RgbImage>)>) -> Self {
        Self {
            items: items.into_iter().map(|(id, img)| (id.to_string(), img)).collect(),
        }
    }
}

impl ImageSource for MemorySource {
    fn identities(&self) -> Vec<String> {
        self.items.iter().map(|(id, _)| id.clone()).collect()
    }

    fn load(&self, identity: &str) -> Result<RgbImage, SourceError> {
        self.items
            .iter()
            .find(|(id, _)| id == identity)
            .and_then(|(_, img)| img.clone())
            .ok_or_else(|| SourceError::Missing(identity.to_string()))
    }
}

/// Records every artifact write; can be told to fail them.
#[derive(Clone, Default)]
pub struct RecordingArtifacts {
    stored: Arc<Mutex<Vec<(String, ArtifactKind, (u32, u32))>>>,
    fail: bool,
}

impl RecordingArtifacts {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn stored(&self) -> Vec<(String, ArtifactKind, (u32, u32))> {
        self.stored.lock().unwrap().clone()
    }
}

impl ArtifactStore for RecordingArtifacts {
    fn store(
        &self,
        identity: &str,
        kind: ArtifactKind,
        image: &RgbImage,
    ) -> Result<Option<PathBuf>, ArtifactError> {
        if self.fail {
            return Err(ArtifactError::Io {
                path: PathBuf::from("/dev/full"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
            });
        }
        self.stored
            .lock()
            .unwrap()
            .push((identity.to_string(), kind, image.dimensions()));
        Ok(Some(PathBuf::from(format!("/artifacts/{identity}.jpg"))))
    }

    fn artifact_paths(&self, identity: &str) -> Vec<PathBuf> {
        let stored = self.stored.lock().unwrap();
        if stored.iter().any(|(id, _, _)| id == identity) {
            vec![PathBuf::from(format!("/artifacts/{identity}.jpg"))]
        } else {
            Vec::new()
        }
    }
}

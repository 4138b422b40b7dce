//! Identity-keyed image artifacts kept for human inspection.
//!
//! Nothing here feeds back into matching. The engine only writes artifacts;
//! removing them is left to whoever calls `delete`, using the paths from
//! [`ArtifactStore::artifact_paths`].

use image::{ImageFormat, RgbImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("encoding artifact {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Canonical crop of a face that was enrolled.
    EnrolledCrop,
    /// Canonical crop of a face refused as a duplicate.
    DuplicateCrop,
    /// The full source image of a successful enrollment.
    Upload,
}

pub trait ArtifactStore: Send + Sync {
    /// Store `image` for `identity`. `Ok(None)` when this store does not
    /// keep artifacts of that kind.
    fn store(
        &self,
        identity: &str,
        kind: ArtifactKind,
        image: &RgbImage,
    ) -> Result<Option<PathBuf>, ArtifactError>;

    /// Every stored artifact belonging to `identity`, sorted.
    fn artifact_paths(&self, identity: &str) -> Vec<PathBuf>;
}

/// Artifacts as JPEG files under a crops directory and an optional uploads
/// directory: `<identity>.jpg` and `<identity>_duplicate.jpg`.
pub struct DirArtifactStore {
    crops_dir: PathBuf,
    uploads_dir: Option<PathBuf>,
}

impl DirArtifactStore {
    pub fn new(crops_dir: impl Into<PathBuf>) -> Self {
        Self {
            crops_dir: crops_dir.into(),
            uploads_dir: None,
        }
    }

    pub fn with_uploads_dir(mut self, uploads_dir: impl Into<PathBuf>) -> Self {
        self.uploads_dir = Some(uploads_dir.into());
        self
    }

    fn path_for(&self, identity: &str, kind: ArtifactKind) -> Option<PathBuf> {
        match kind {
            ArtifactKind::EnrolledCrop => Some(self.crops_dir.join(format!("{identity}.jpg"))),
            ArtifactKind::DuplicateCrop => {
                Some(self.crops_dir.join(format!("{identity}_duplicate.jpg")))
            }
            ArtifactKind::Upload => {
                self.uploads_dir.as_ref().map(|d| d.join(format!("{identity}.jpg")))
            }
        }
    }
}

impl ArtifactStore for DirArtifactStore {
    fn store(
        &self,
        identity: &str,
        kind: ArtifactKind,
        image: &RgbImage,
    ) -> Result<Option<PathBuf>, ArtifactError> {
        let Some(path) = self.path_for(identity, kind) else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ArtifactError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        image
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| ArtifactError::Image {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(identity, ?kind, path = %path.display(), "stored artifact");
        Ok(Some(path))
    }

    fn artifact_paths(&self, identity: &str) -> Vec<PathBuf> {
        let duplicate_stem = format!("{identity}_duplicate");
        let mut paths: Vec<PathBuf> = std::iter::once(&self.crops_dir)
            .chain(self.uploads_dir.as_ref())
            .flat_map(|dir| files_in(dir))
            .filter(|path| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| stem == identity || stem == duplicate_stem)
            })
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot list artifact directory");
            Vec::new()
        }
    }
}

/// Discards every artifact.
pub struct NoArtifacts;

impl ArtifactStore for NoArtifacts {
    fn store(
        &self,
        _identity: &str,
        _kind: ArtifactKind,
        _image: &RgbImage,
    ) -> Result<Option<PathBuf>, ArtifactError> {
        Ok(None)
    }

    fn artifact_paths(&self, _identity: &str) -> Vec<PathBuf> {
        Vec::new()
    }
}

//! Identity-keyed image sources for bulk reconcile.

use image::RgbImage;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("scanning {path}: {source}")]
    Scan { path: PathBuf, source: io::Error },
    #[error("no image for identity '{0}'")]
    Missing(String),
    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// A set of images, each keyed by the identity it should be enrolled as.
pub trait ImageSource {
    /// Identities in the order they should be processed.
    fn identities(&self) -> Vec<String>;

    /// Decode the image for `identity` as RGB.
    fn load(&self, identity: &str) -> Result<RgbImage, SourceError>;
}

/// Images in one directory, identity = file stem, sorted by stem.
///
/// Images are decoded lazily in [`load`](ImageSource::load) so one bad file
/// fails one item, not the scan.
pub struct DirectoryImageSource {
    dir: PathBuf,
    files: BTreeMap<String, PathBuf>,
}

impl DirectoryImageSource {
    pub fn scan(dir: &Path) -> Result<Self, SourceError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|source| SourceError::Scan {
                path: dir.to_path_buf(),
                source,
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        paths.sort();

        let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                tracing::warn!(path = %path.display(), "skipping image with non-UTF-8 name");
                continue;
            };
            if let Some(kept) = files.get(&stem) {
                tracing::warn!(
                    identity = %stem,
                    kept = %kept.display(),
                    ignored = %path.display(),
                    "several images share one identity; using the first"
                );
                continue;
            }
            files.insert(stem, path);
        }

        tracing::debug!(dir = %dir.display(), images = files.len(), "scanned image directory");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

impl ImageSource for DirectoryImageSource {
    fn identities(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn load(&self, identity: &str) -> Result<RgbImage, SourceError> {
        let path = self
            .files
            .get(identity)
            .ok_or_else(|| SourceError::Missing(identity.to_string()))?;
        let image = image::open(path).map_err(|source| SourceError::Decode {
            path: path.clone(),
            source,
        })?;
        Ok(image.to_rgb8())
    }
}

use anyhow::{Context, Result};
use rollcall_core::{Backend, BackendChoice, Thresholds};
use rollcall_engine::MultiFacePolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: optional TOML file, then `ROLLCALL_*` environment
/// variables, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for everything below unless set individually.
    pub data_dir: PathBuf,
    /// Roster document (JSON).
    pub roster_path: PathBuf,
    /// Canonical face crops written at enrollment.
    pub crops_dir: PathBuf,
    /// Source images of enrollments; also the default reconcile directory.
    pub uploads_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub backend: BackendChoice,
    /// Replaces the backend's default duplicate confidence floor.
    pub duplicate_confidence: Option<f32>,
    /// Replaces the backend's default recognition confidence floor.
    pub recognition_confidence: Option<f32>,
    pub multi_face: MultiFacePolicy,
}

/// On-disk form of [`Config`]. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub roster_path: Option<PathBuf>,
    pub crops_dir: Option<PathBuf>,
    pub uploads_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub backend: Option<String>,
    pub duplicate_confidence: Option<f32>,
    pub recognition_confidence: Option<f32>,
    pub multi_face: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => FileConfig::load(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge `file` with the variables `env` returns. Environment wins.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path =
            |key: &str, from_file: Option<PathBuf>| env(key).map(PathBuf::from).or(from_file);

        let data_dir =
            path("ROLLCALL_DATA_DIR", file.data_dir).unwrap_or_else(|| default_data_dir(&env));

        let backend = match env("ROLLCALL_BACKEND").or(file.backend) {
            Some(s) => s.parse().map_err(anyhow::Error::msg)?,
            None => BackendChoice::default(),
        };
        let multi_face = match env("ROLLCALL_MULTI_FACE").or(file.multi_face) {
            Some(s) => s.parse().map_err(anyhow::Error::msg)?,
            None => MultiFacePolicy::default(),
        };

        Ok(Self {
            roster_path: path("ROLLCALL_ROSTER_PATH", file.roster_path)
                .unwrap_or_else(|| data_dir.join("roster.json")),
            crops_dir: path("ROLLCALL_CROPS_DIR", file.crops_dir)
                .unwrap_or_else(|| data_dir.join("crops")),
            uploads_dir: path("ROLLCALL_UPLOADS_DIR", file.uploads_dir)
                .unwrap_or_else(|| data_dir.join("uploads")),
            model_dir: path("ROLLCALL_MODEL_DIR", file.model_dir)
                .unwrap_or_else(rollcall_core::default_model_dir),
            backend,
            duplicate_confidence: env_f32(&env, "ROLLCALL_DUPLICATE_CONFIDENCE")
                .or(file.duplicate_confidence),
            recognition_confidence: env_f32(&env, "ROLLCALL_RECOGNITION_CONFIDENCE")
                .or(file.recognition_confidence),
            multi_face,
            data_dir,
        })
    }

    /// The operating points for `backend`, with any configured overrides.
    pub fn thresholds(&self, backend: &Backend) -> Thresholds {
        Thresholds {
            duplicate: self.duplicate_confidence.unwrap_or(backend.thresholds.duplicate),
            recognition: self.recognition_confidence.unwrap_or(backend.thresholds.recognition),
        }
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_f32(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f32> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable number");
            None
        }
    }
}

use rollcall_core::{EncoderError, PolicyError};
use thiserror::Error;

use crate::source::SourceError;
use crate::storage::StorageError;

/// Every way a caller-facing operation can fail.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected")]
    NoFace,
    #[error("{count} faces detected; enrollment needs exactly one")]
    MultipleFaces { count: usize },
    #[error("face matches enrolled identity '{identity}' (confidence {confidence:.3})")]
    DuplicateOf { identity: String, confidence: f32 },
    #[error("identity '{0}' not found")]
    NotFound(String),
    #[error("identity '{0}' already exists")]
    Conflict(String),
    #[error("invalid identity {identity:?}: {reason}")]
    InvalidIdentity { identity: String, reason: &'static str },
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("encoder backend mismatch: expected {expected}, got {actual}")]
    BackendMismatch { expected: String, actual: String },
    #[error("roster was written by backend '{recorded}', but the active encoder is '{active}'")]
    ForeignRoster { recorded: String, active: String },
    #[error("descriptor contains non-finite values")]
    NonFiniteDescriptor,
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("similarity policy: {0}")]
    Policy(PolicyError),
    #[error("image source: {0}")]
    Source(#[from] SourceError),
}

impl EngineError {
    /// Whether the caller can report this and carry on.
    ///
    /// Unrecoverable errors mean the engine has no trustworthy roster or
    /// encoder to work with.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Storage(e) => e.is_recoverable(),
            EngineError::ForeignRoster { .. }
            | EngineError::Encoder(_)
            | EngineError::Policy(_) => false,
            _ => true,
        }
    }
}

impl From<PolicyError> for EngineError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::DimensionMismatch { expected, actual } => EngineError::BackendMismatch {
                expected: format!("{expected}-d descriptor"),
                actual: format!("{actual}-d descriptor"),
            },
            other => EngineError::Policy(other),
        }
    }
}

//! rollcall-engine: roster store and the enroll/verify/maintenance workflows.
//!
//! The [`Engine`] owns one encoder, one similarity policy and one
//! [`RosterStore`]. Every caller-facing operation is a method on it and
//! returns a `Result` whose error is an [`EngineError`].

pub mod artifacts;
pub mod engine;
pub mod error;
pub mod identity;
pub mod maintenance;
pub mod roster;
pub mod schema;
pub mod source;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use artifacts::{ArtifactKind, ArtifactStore, DirArtifactStore, NoArtifacts};
pub use engine::{DetectReport, Engine, EnrollReceipt, MultiFacePolicy, VerifyReport};
pub use error::EngineError;
pub use maintenance::{
    DeleteResult, ItemOutcome, ReconcileItem, ReconcileMode, ReconcileReport, RenameResult,
    RosterSummary,
};
pub use roster::{Roster, RosterEntry, RosterStore};
pub use source::{DirectoryImageSource, ImageSource};
pub use storage::{FileBackend, MemoryBackend, RosterBackend, StorageError};

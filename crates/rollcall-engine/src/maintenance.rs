//! Roster upkeep: delete, rename, listing and bulk reconcile.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::identity::validate_identity;
use crate::source::{DirectoryImageSource, ImageSource};

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub identity: String,
    /// Whether the identity was enrolled. Deleting an unknown one is a no-op.
    pub found: bool,
    /// Stored artifacts for the identity, left for the caller to remove.
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameResult {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterSummary {
    pub backend: String,
    pub dimension: usize,
    pub count: usize,
    /// Insertion order.
    pub identities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// Enroll only identities not already in the roster.
    #[default]
    Incremental,
    /// Clear the roster first and enroll everything from scratch.
    Rebuild,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Enrolled,
    SkippedAlreadyEnrolled,
    SkippedDuplicate { of: String, confidence: f32 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileItem {
    pub identity: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub items: Vec<ReconcileItem>,
    pub enrolled: usize,
    pub skipped_already_enrolled: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    pub roster_before: usize,
    pub roster_after: usize,
}

impl ReconcileReport {
    fn record(&mut self, identity: String, outcome: ItemOutcome) {
        match &outcome {
            ItemOutcome::Enrolled => self.enrolled += 1,
            ItemOutcome::SkippedAlreadyEnrolled => self.skipped_already_enrolled += 1,
            ItemOutcome::SkippedDuplicate { .. } => self.skipped_duplicate += 1,
            ItemOutcome::Failed { reason } => {
                tracing::warn!(identity = %identity, reason = %reason, "reconcile item failed");
                self.failed += 1;
            }
        }
        self.items.push(ReconcileItem { identity, outcome });
    }
}

impl Engine {
    /// Remove `identity` from the roster.
    pub fn delete(&self, identity: &str) -> Result<DeleteResult, EngineError> {
        validate_identity(identity)?;
        let found = self.store.writer().remove(identity)?;
        if found {
            tracing::info!(identity, "deleted");
        } else {
            tracing::debug!(identity, "delete of unknown identity");
        }
        Ok(DeleteResult {
            identity: identity.to_string(),
            found,
            artifacts: self.artifacts.artifact_paths(identity),
        })
    }

    /// Relabel `from` as `to`. Never merges: an existing `to` is a `Conflict`.
    pub fn rename(&self, from: &str, to: &str) -> Result<RenameResult, EngineError> {
        validate_identity(from)?;
        validate_identity(to)?;
        self.store.writer().rename(from, to)?;
        tracing::info!(from, to, "renamed");
        Ok(RenameResult {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn list(&self) -> RosterSummary {
        let roster = self.store.snapshot();
        RosterSummary {
            backend: self.store.backend_id().to_string(),
            dimension: self.store.dimension(),
            count: roster.len(),
            identities: roster.identities(),
        }
    }

    /// Reconcile the roster with the images in `dir`, keyed by file stem.
    pub fn reconcile(
        &self,
        dir: &Path,
        mode: ReconcileMode,
    ) -> Result<ReconcileReport, EngineError> {
        let source = DirectoryImageSource::scan(dir)?;
        self.reconcile_from(&source, mode)
    }

    /// Enroll every identity from `source` under a single mutation lock.
    ///
    /// Each new entry is committed before the next item is checked, so two
    /// images of one person in the same batch still dedupe against each
    /// other. Per-item problems are recorded in the report; a storage
    /// failure aborts the run, leaving the items committed so far in place.
    pub fn reconcile_from(
        &self,
        source: &dyn ImageSource,
        mode: ReconcileMode,
    ) -> Result<ReconcileReport, EngineError> {
        let mut writer = self.store.writer();
        let mut report = ReconcileReport {
            roster_before: writer.roster().len(),
            ..ReconcileReport::default()
        };

        if mode == ReconcileMode::Rebuild {
            let cleared = writer.clear()?;
            tracing::info!(cleared, "cleared roster for rebuild");
        }

        for identity in source.identities() {
            if let Err(e) = validate_identity(&identity) {
                report.record(identity, ItemOutcome::Failed { reason: e.to_string() });
                continue;
            }
            if writer.roster().contains(&identity) {
                report.record(identity, ItemOutcome::SkippedAlreadyEnrolled);
                continue;
            }

            let image = match source.load(&identity) {
                Ok(image) => image,
                Err(e) => {
                    report.record(identity, ItemOutcome::Failed { reason: e.to_string() });
                    continue;
                }
            };
            let face = match self.encode(&image).and_then(|d| self.select_face(d)) {
                Ok(face) => face,
                Err(e) => {
                    report.record(identity, ItemOutcome::Failed { reason: e.to_string() });
                    continue;
                }
            };

            match self.commit_enrollment(&mut writer, &identity, &face, &image, false, false) {
                Ok(_) => report.record(identity, ItemOutcome::Enrolled),
                Err(EngineError::DuplicateOf { identity: of, confidence }) => {
                    report.record(identity, ItemOutcome::SkippedDuplicate { of, confidence });
                }
                Err(e @ EngineError::Storage(_)) => {
                    tracing::error!(
                        identity = %identity,
                        error = %e,
                        "roster write failed; aborting reconcile"
                    );
                    return Err(e);
                }
                Err(e) => report.record(identity, ItemOutcome::Failed { reason: e.to_string() }),
            }
        }

        report.roster_after = writer.roster().len();
        tracing::info!(
            enrolled = report.enrolled,
            skipped_already_enrolled = report.skipped_already_enrolled,
            skipped_duplicate = report.skipped_duplicate,
            failed = report.failed,
            roster = report.roster_after,
            "reconcile complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactKind, DirArtifactStore};
    use crate::roster::RosterStore;
    use crate::storage::MemoryBackend;
    use crate::testing::*;
    use rollcall_core::SimilarityPolicy;

    fn engine_with(backend: &MemoryBackend, artifacts: RecordingArtifacts) -> Engine {
        let encoder = StubEncoder::new()
            .face(1, [1.0, 0.0, 0.0])
            .face(2, [0.0, 1.0, 0.0])
            // Same person as tag 1
            .face(3, [1.0, 0.1, 0.0])
            .face(4, [0.0, 0.0, 1.0])
            .faces(5, vec![([0.5, 0.5, 0.0], face_at(0.0)), ([0.0, 0.5, 0.5], face_at(50.0))]);
        let store = RosterStore::open(Box::new(backend.clone()), &test_backend()).unwrap();
        let policy = SimilarityPolicy::for_backend(&test_backend()).unwrap();
        Engine::new(Box::new(encoder), policy, store, Box::new(artifacts)).unwrap()
    }

    fn engine() -> (Engine, MemoryBackend) {
        let backend = MemoryBackend::new();
        (engine_with(&backend, RecordingArtifacts::default()), backend)
    }

    fn two_items() -> MemorySource {
        MemorySource::new(vec![("a", Some(tagged_image(1))), ("b", Some(tagged_image(2)))])
    }

    fn outcome<'r>(report: &'r ReconcileReport, identity: &str) -> &'r ItemOutcome {
        &report.items.iter().find(|i| i.identity == identity).unwrap().outcome
    }

    #[test]
    fn test_delete_reports_found_and_artifacts() {
        let (engine, _) = engine();
        engine.enroll("alice", &tagged_image(1), false).unwrap();

        let result = engine.delete("alice").unwrap();
        assert!(result.found);
        assert_eq!(result.artifacts, vec![PathBuf::from("/artifacts/alice.jpg")]);
        assert!(engine.list().identities.is_empty());
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let (engine, backend) = engine();
        let result = engine.delete("ghost").unwrap();
        assert!(!result.found);
        assert!(result.artifacts.is_empty());
        assert_eq!(backend.save_count(), 0);
    }

    #[test]
    fn test_rename_keeps_descriptor() {
        let (engine, _) = engine();
        engine.enroll("alice", &tagged_image(1), false).unwrap();
        let result = engine.rename("alice", "alicia").unwrap();
        assert_eq!(result.to, "alicia");

        let roster = engine.store().snapshot();
        assert!(!roster.contains("alice"));
        assert_eq!(roster.get("alicia").unwrap().descriptor, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rename_conflict_and_not_found() {
        let (engine, _) = engine();
        engine.enroll("alice", &tagged_image(1), false).unwrap();
        engine.enroll("bob", &tagged_image(2), false).unwrap();

        assert!(matches!(engine.rename("alice", "bob"), Err(EngineError::Conflict(_))));
        assert!(matches!(engine.rename("carol", "dave"), Err(EngineError::NotFound(_))));
        assert!(matches!(engine.rename("alice", "a/b"), Err(EngineError::InvalidIdentity { .. })));
        assert_eq!(engine.list().identities, vec!["alice", "bob"]);
    }

    #[test]
    fn test_list_summary() {
        let (engine, _) = engine();
        engine.enroll("bob", &tagged_image(2), false).unwrap();
        engine.enroll("alice", &tagged_image(1), false).unwrap();

        let summary = engine.list();
        assert_eq!(summary.backend, "test-3d");
        assert_eq!(summary.dimension, 3);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.identities, vec!["bob", "alice"]);
    }

    #[test]
    fn test_reconcile_dedupes_within_batch() {
        let (engine, _) = engine();
        let source = MemorySource::new(vec![
            ("a1", Some(tagged_image(1))),
            ("a2", Some(tagged_image(3))),
            ("b", Some(tagged_image(2))),
        ]);

        let report = engine.reconcile_from(&source, ReconcileMode::Incremental).unwrap();
        assert_eq!(report.enrolled, 2);
        assert_eq!(report.skipped_duplicate, 1);
        assert!(matches!(
            outcome(&report, "a2"),
            ItemOutcome::SkippedDuplicate { of, .. } if of == "a1"
        ));
        assert_eq!(report.roster_before, 0);
        assert_eq!(report.roster_after, 2);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (engine, backend) = engine();
        let source = two_items();

        let first = engine.reconcile_from(&source, ReconcileMode::Incremental).unwrap();
        assert_eq!(first.enrolled, 2);
        let saves = backend.save_count();

        let second = engine.reconcile_from(&source, ReconcileMode::Incremental).unwrap();
        assert_eq!(second.enrolled, 0);
        assert_eq!(second.skipped_already_enrolled, 2);
        assert_eq!(backend.save_count(), saves);
        assert_eq!(second.roster_before, second.roster_after);
    }

    #[test]
    fn test_reconcile_records_failures() {
        let (engine, _) = engine();
        let source = MemorySource::new(vec![
            ("unreadable", None),
            ("faceless", Some(tagged_image(0))),
            ("crowd", Some(tagged_image(5))),
            ("broken", Some(tagged_image(FAILING_TAG))),
            ("bad/name", Some(tagged_image(4))),
            ("ok", Some(tagged_image(4))),
        ]);

        let report = engine.reconcile_from(&source, ReconcileMode::Incremental).unwrap();
        assert_eq!(report.failed, 5);
        assert_eq!(report.enrolled, 1);
        assert_eq!(report.items.len(), 6);
        assert_eq!(outcome(&report, "ok"), &ItemOutcome::Enrolled);
    }

    #[test]
    fn test_reconcile_rebuild_reenrolls_everything() {
        let (engine, _) = engine();
        engine.enroll("a", &tagged_image(1), false).unwrap();
        engine.enroll("stale", &tagged_image(4), false).unwrap();
        let source = two_items();

        let report = engine.reconcile_from(&source, ReconcileMode::Rebuild).unwrap();
        assert_eq!(report.roster_before, 2);
        assert_eq!(report.enrolled, 2);
        assert_eq!(report.skipped_already_enrolled, 0);
        assert_eq!(engine.list().identities, vec!["a", "b"]);
    }

    #[test]
    fn test_reconcile_aborts_on_storage_failure() {
        let (engine, backend) = engine();
        backend.set_fail_writes(true);
        let source = two_items();

        let err = engine.reconcile_from(&source, ReconcileMode::Incremental).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(engine.list().identities.is_empty());
    }

    #[test]
    fn test_reconcile_directory() {
        let dir = tempfile::tempdir().unwrap();
        tagged_image(1).save(dir.path().join("alice.png")).unwrap();
        tagged_image(2).save(dir.path().join("bob.png")).unwrap();

        let (engine, _) = engine();
        let report = engine.reconcile(dir.path(), ReconcileMode::Incremental).unwrap();
        assert_eq!(report.enrolled, 2);
        assert_eq!(engine.list().identities, vec!["alice", "bob"]);

        let missing = engine.reconcile(&dir.path().join("absent"), ReconcileMode::Incremental);
        assert!(matches!(missing, Err(EngineError::Source(_))));
    }

    #[test]
    fn test_reconcile_leaves_uploads_untouched() {
        let data = tempfile::tempdir().unwrap();
        let uploads = data.path().join("uploads");
        let crops = data.path().join("crops");
        std::fs::create_dir_all(&uploads).unwrap();
        tagged_image(1).save(uploads.join("alice.png")).unwrap();
        let original = std::fs::read(uploads.join("alice.png")).unwrap();

        let store = RosterStore::open(Box::new(MemoryBackend::new()), &test_backend()).unwrap();
        let policy = SimilarityPolicy::for_backend(&test_backend()).unwrap();
        let artifacts = DirArtifactStore::new(&crops).with_uploads_dir(&uploads);
        let encoder = StubEncoder::new().face(1, [1.0, 0.0, 0.0]);
        let engine = Engine::new(Box::new(encoder), policy, store, Box::new(artifacts)).unwrap();

        let report = engine.reconcile(&uploads, ReconcileMode::Incremental).unwrap();
        assert_eq!(report.enrolled, 1);

        let mut names: Vec<String> = std::fs::read_dir(&uploads)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["alice.png"]);
        assert_eq!(std::fs::read(uploads.join("alice.png")).unwrap(), original);
        assert!(crops.join("alice.jpg").is_file());
    }

    #[test]
    fn test_reconcile_stores_crops_but_no_uploads() {
        let backend = MemoryBackend::new();
        let artifacts = RecordingArtifacts::default();
        let engine = engine_with(&backend, artifacts.clone());
        let source = MemorySource::new(vec![("alice", Some(tagged_image(1)))]);

        engine.reconcile_from(&source, ReconcileMode::Incremental).unwrap();
        let kinds: Vec<ArtifactKind> =
            artifacts.stored().into_iter().map(|(_, kind, _)| kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::EnrolledCrop]);
    }

    #[test]
    fn test_report_serializes_outcomes_flat() {
        let mut report = ReconcileReport::default();
        let outcome = ItemOutcome::SkippedDuplicate { of: "b".into(), confidence: 1.0 };
        report.record("a".into(), outcome);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["items"][0]["identity"], "a");
        assert_eq!(json["items"][0]["outcome"], "skipped_duplicate");
        assert_eq!(json["items"][0]["of"], "b");
        assert_eq!(json["skipped_duplicate"], 1);
    }
}

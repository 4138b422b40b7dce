//! Enrollment and verification against the roster.

use image::RgbImage;
use rollcall_core::crop::{normalized_crop, CANONICAL_CROP_SIZE};
use rollcall_core::{BoundingBox, Descriptor, FaceEncoder, MatchResult, Score, SimilarityPolicy};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::error::EngineError;
use crate::identity::validate_identity;
use crate::roster::{Roster, RosterEntry, RosterStore, RosterWriter};

/// What enrollment does with an image showing more than one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiFacePolicy {
    /// Refuse with `MultipleFaces`.
    #[default]
    Reject,
    /// Enroll the face with the largest bounding box.
    Largest,
}

impl FromStr for MultiFacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "largest" => Ok(Self::Largest),
            other => Err(format!(
                "unknown multi-face policy '{other}' (expected reject or largest)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollReceipt {
    pub identity: String,
    /// The identity already had an entry, which this one replaced.
    pub replaced: bool,
    /// Set when `force` pushed the enrollment past a duplicate of this identity.
    pub duplicate_overridden: Option<String>,
    pub bbox: BoundingBox,
    pub roster_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// At most one result per identity, in detection order.
    pub matches: Vec<MatchResult>,
    pub faces_detected: usize,
    pub identities_recognized: usize,
    /// Faces whose best candidate was indistinguishable from the probe.
    pub degenerate_faces: usize,
}

/// Faces found in an image, with no roster lookup.
#[derive(Debug, Clone, Serialize)]
pub struct DetectReport {
    pub image_width: u32,
    pub image_height: u32,
    pub faces_detected: usize,
    pub boxes: Vec<BoundingBox>,
    /// Length of each descriptor the active encoder produces.
    pub dimension: usize,
}

/// The matcher: owns the encoder, the policy and the roster store.
///
/// Lock order is roster mutation lock, then encoder lock. Verification only
/// ever takes the encoder lock and reads a roster snapshot.
pub struct Engine {
    pub(crate) encoder: Mutex<Box<dyn FaceEncoder>>,
    pub(crate) policy: SimilarityPolicy,
    pub(crate) store: RosterStore,
    pub(crate) artifacts: Box<dyn ArtifactStore>,
    pub(crate) multi_face: MultiFacePolicy,
}

/// Best roster candidate for one probe descriptor.
struct Candidate<'r> {
    entry: &'r RosterEntry,
    score: Score,
}

impl Engine {
    /// Fails with `ForeignRoster` if the roster belongs to another encoder
    /// backend, and with `BackendMismatch` if the policy's dimension differs.
    pub fn new(
        encoder: Box<dyn FaceEncoder>,
        policy: SimilarityPolicy,
        store: RosterStore,
        artifacts: Box<dyn ArtifactStore>,
    ) -> Result<Self, EngineError> {
        let backend = encoder.backend();
        if backend.id != store.backend_id() {
            return Err(EngineError::ForeignRoster {
                recorded: store.backend_id().to_string(),
                active: backend.id.clone(),
            });
        }
        if backend.dimension != policy.dimension() || backend.dimension != store.dimension() {
            return Err(EngineError::BackendMismatch {
                expected: format!("{}-d descriptor", store.dimension()),
                actual: format!("{}-d descriptor", backend.dimension),
            });
        }

        tracing::info!(
            backend = %backend.id,
            duplicate = policy.thresholds().duplicate,
            recognition = policy.thresholds().recognition,
            "engine ready"
        );
        Ok(Self {
            encoder: Mutex::new(encoder),
            policy,
            store,
            artifacts,
            multi_face: MultiFacePolicy::default(),
        })
    }

    pub fn with_multi_face_policy(mut self, policy: MultiFacePolicy) -> Self {
        self.multi_face = policy;
        self
    }

    pub fn policy(&self) -> &SimilarityPolicy {
        &self.policy
    }

    pub fn store(&self) -> &RosterStore {
        &self.store
    }

    /// Enroll the single face in `image` as `identity`.
    ///
    /// Refused as `DuplicateOf` when the face already matches another
    /// identity at duplicate strength, unless `force` is set. Re-enrolling
    /// an existing identity replaces its entry.
    pub fn enroll(
        &self,
        identity: &str,
        image: &RgbImage,
        force: bool,
    ) -> Result<EnrollReceipt, EngineError> {
        validate_identity(identity)?;
        let descriptors = self.encode(image)?;
        let face = self.select_face(descriptors)?;

        let mut writer = self.store.writer();
        self.commit_enrollment(&mut writer, identity, &face, image, force, true)
    }

    /// Detect and encode faces without touching the roster.
    pub fn detect(&self, image: &RgbImage) -> Result<DetectReport, EngineError> {
        let descriptors = self.encode(image)?;
        if descriptors.is_empty() {
            return Err(EngineError::NoFace);
        }
        tracing::debug!(faces = descriptors.len(), "detection only");
        Ok(DetectReport {
            image_width: image.width(),
            image_height: image.height(),
            faces_detected: descriptors.len(),
            boxes: descriptors.iter().map(|d| *d.bbox()).collect(),
            dimension: self.store.dimension(),
        })
    }

    /// Match every face in `image` against the roster.
    pub fn verify(&self, image: &RgbImage) -> Result<VerifyReport, EngineError> {
        let descriptors = self.encode(image)?;
        if descriptors.is_empty() {
            return Err(EngineError::NoFace);
        }
        let roster = self.store.snapshot();

        let mut accepted = Vec::new();
        let mut degenerate_faces = 0;
        for (face, descriptor) in descriptors.iter().enumerate() {
            let Some(candidate) = self.best_candidate(&roster, descriptor.vector())? else {
                continue;
            };
            let Candidate { entry, score } = candidate;

            if self.policy.is_degenerate(&score) {
                tracing::warn!(
                    face,
                    identity = %entry.identity,
                    distance = score.distance,
                    "probe indistinguishable from an enrolled descriptor; rejecting as degenerate"
                );
                degenerate_faces += 1;
                continue;
            }
            if !self.policy.is_recognized(&score) {
                tracing::debug!(
                    face,
                    identity = %entry.identity,
                    confidence = score.confidence,
                    "below recognition floor"
                );
                continue;
            }
            accepted.push(MatchResult {
                identity: entry.identity.clone(),
                confidence: score.confidence,
                distance: score.distance,
                bbox: *descriptor.bbox(),
            });
        }

        let matches = dedup_by_identity(accepted);
        tracing::info!(
            faces = descriptors.len(),
            recognized = matches.len(),
            degenerate = degenerate_faces,
            "verification complete"
        );
        Ok(VerifyReport {
            identities_recognized: matches.len(),
            faces_detected: descriptors.len(),
            degenerate_faces,
            matches,
        })
    }

    /// Run the encoder and make sure its output belongs to the roster's backend.
    pub(crate) fn encode(&self, image: &RgbImage) -> Result<Vec<Descriptor>, EngineError> {
        let descriptors = {
            let mut encoder = self.encoder.lock().unwrap_or_else(PoisonError::into_inner);
            encoder.detect_and_encode(image)?
        };
        for d in &descriptors {
            if d.backend() != self.store.backend_id() {
                return Err(EngineError::BackendMismatch {
                    expected: self.store.backend_id().to_string(),
                    actual: d.backend().to_string(),
                });
            }
            if d.vector().iter().any(|v| !v.is_finite()) {
                tracing::warn!(bbox = ?d.bbox(), "encoder produced a non-finite descriptor");
                return Err(EngineError::NonFiniteDescriptor);
            }
        }
        Ok(descriptors)
    }

    /// Pick the face to enroll according to the multi-face policy.
    pub(crate) fn select_face(
        &self,
        mut descriptors: Vec<Descriptor>,
    ) -> Result<Descriptor, EngineError> {
        match descriptors.len() {
            0 => Err(EngineError::NoFace),
            1 => Ok(descriptors.remove(0)),
            count => match self.multi_face {
                MultiFacePolicy::Reject => Err(EngineError::MultipleFaces { count }),
                MultiFacePolicy::Largest => {
                    let mut best = 0;
                    for (i, d) in descriptors.iter().enumerate() {
                        if d.bbox().area() > descriptors[best].bbox().area() {
                            best = i;
                        }
                    }
                    tracing::debug!(count, chosen = best, "several faces; enrolling the largest");
                    Ok(descriptors.swap_remove(best))
                }
            },
        }
    }

    /// Duplicate check, roster write and artifacts for one encoded face.
    ///
    /// Runs under `writer` so the duplicate scan sees every entry committed
    /// before it, including ones from earlier in the same reconcile.
    /// `store_upload` is false when the image already lives in the uploads
    /// directory.
    pub(crate) fn commit_enrollment(
        &self,
        writer: &mut RosterWriter<'_>,
        identity: &str,
        face: &Descriptor,
        image: &RgbImage,
        force: bool,
        store_upload: bool,
    ) -> Result<EnrollReceipt, EngineError> {
        let roster = writer.roster();
        let mut duplicate_overridden = None;

        if let Some(dup) = self.find_duplicate(&roster, identity, face.vector())? {
            let Candidate { entry, score } = dup;
            if !force {
                tracing::info!(
                    identity,
                    duplicate_of = %entry.identity,
                    confidence = score.confidence,
                    "enrollment refused: duplicate face"
                );
                self.store_artifact(identity, ArtifactKind::DuplicateCrop, image, face);
                return Err(EngineError::DuplicateOf {
                    identity: entry.identity.clone(),
                    confidence: score.confidence,
                });
            }
            tracing::warn!(
                identity,
                duplicate_of = %entry.identity,
                confidence = score.confidence,
                "duplicate overridden by force"
            );
            duplicate_overridden = Some(entry.identity.clone());
        }

        let replaced = writer.upsert(RosterEntry::new(identity, face.vector().to_vec()))?;
        let roster_size = writer.roster().len();
        tracing::info!(identity, replaced, roster_size, "enrolled");

        self.store_artifact(identity, ArtifactKind::EnrolledCrop, image, face);
        if store_upload {
            self.store_artifact(identity, ArtifactKind::Upload, image, face);
        }

        Ok(EnrollReceipt {
            identity: identity.to_string(),
            replaced,
            duplicate_overridden,
            bbox: *face.bbox(),
            roster_size,
        })
    }

    /// Highest confidence wins; ties go to the lower distance, then to the
    /// earlier roster entry.
    fn best_candidate<'r>(
        &self,
        roster: &'r Roster,
        probe: &[f32],
    ) -> Result<Option<Candidate<'r>>, EngineError> {
        let mut best: Option<Candidate<'r>> = None;
        for entry in roster.iter() {
            let score = self.policy.score(&entry.descriptor, probe)?;
            tracing::trace!(
                identity = %entry.identity,
                distance = score.distance,
                confidence = score.confidence,
                "scored"
            );
            let better = best.as_ref().map_or(true, |b| score.outranks(&b.score));
            if better {
                best = Some(Candidate { entry, score });
            }
        }
        Ok(best)
    }

    /// Strongest duplicate of `probe` among entries other than `identity`'s own.
    ///
    /// A near-zero distance always counts as a duplicate.
    fn find_duplicate<'r>(
        &self,
        roster: &'r Roster,
        identity: &str,
        probe: &[f32],
    ) -> Result<Option<Candidate<'r>>, EngineError> {
        let mut best: Option<Candidate<'r>> = None;
        for entry in roster.iter().filter(|e| e.identity != identity) {
            let score = self.policy.score(&entry.descriptor, probe)?;
            if !(self.policy.is_duplicate(&score) || self.policy.is_degenerate(&score)) {
                continue;
            }
            let stronger = best.as_ref().map_or(true, |b| score.outranks(&b.score));
            if stronger {
                best = Some(Candidate { entry, score });
            }
        }
        Ok(best)
    }

    fn store_artifact(
        &self,
        identity: &str,
        kind: ArtifactKind,
        image: &RgbImage,
        face: &Descriptor,
    ) {
        let artifact = match kind {
            ArtifactKind::Upload => Some(image.clone()),
            ArtifactKind::EnrolledCrop | ArtifactKind::DuplicateCrop => {
                normalized_crop(image, face.bbox(), CANONICAL_CROP_SIZE)
            }
        };
        let Some(artifact) = artifact else {
            return;
        };
        if let Err(e) = self.artifacts.store(identity, kind, &artifact) {
            tracing::warn!(identity, ?kind, error = %e, "failed to store artifact");
        }
    }
}

/// Keep the highest-confidence result for each identity, in detection order.
fn dedup_by_identity(results: Vec<MatchResult>) -> Vec<MatchResult> {
    let mut strongest: HashMap<&str, usize> = HashMap::new();
    for (i, r) in results.iter().enumerate() {
        strongest
            .entry(r.identity.as_str())
            .and_modify(|best| {
                if r.confidence > results[*best].confidence {
                    *best = i;
                }
            })
            .or_insert(i);
    }

    let keep: Vec<usize> = {
        let mut keep: Vec<usize> = strongest.into_values().collect();
        keep.sort_unstable();
        keep
    };
    if keep.len() < results.len() {
        tracing::debug!(
            dropped = results.len() - keep.len(),
            "merged repeated identities across faces"
        );
    }

    let mut slots: Vec<Option<MatchResult>> = results.into_iter().map(Some).collect();
    keep.into_iter().filter_map(|i| slots[i].take()).collect()
}

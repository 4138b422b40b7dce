//! Roster document codec.
//!
//! Current documents look like
//! `{"version":1,"backend":"...","dimension":N,"entries":[...]}`.
//! Two older layouts stored parallel arrays, `{"encodings":[[...]],"student_ids":[...]}`
//! and `{"embeddings":[[...]],"student_ids":[...]}`. Both are accepted on
//! load and upgraded the next time the roster is written.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::identity::validate_identity;
use crate::roster::RosterEntry;
use crate::storage::StorageError;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RosterDocument {
    version: u32,
    backend: String,
    dimension: usize,
    entries: Vec<RosterEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnyDocument {
    Current(RosterDocument),
    Encodings {
        encodings: Vec<Vec<Option<f32>>>,
        student_ids: Vec<String>,
    },
    Embeddings {
        embeddings: Vec<Vec<Option<f32>>>,
        student_ids: Vec<String>,
    },
}

/// Layout a document was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Current { backend: String, dimension: usize },
    /// Parallel-array layout, named by its vector field.
    Legacy(&'static str),
}

#[derive(Debug)]
pub struct Decoded {
    pub layout: Layout,
    pub entries: Vec<RosterEntry>,
    /// Vectors or ids without a partner in a legacy document.
    pub unpaired: usize,
}

impl Decoded {
    pub fn is_legacy(&self) -> bool {
        matches!(self.layout, Layout::Legacy(_))
    }
}

pub fn decode(bytes: &[u8]) -> Result<Decoded, StorageError> {
    let doc: AnyDocument = serde_json::from_slice(bytes)
        .map_err(|e| StorageError::Corrupt(format!("unrecognised roster document: {e}")))?;

    match doc {
        AnyDocument::Current(doc) => {
            if doc.version != SCHEMA_VERSION {
                return Err(StorageError::Corrupt(format!(
                    "unsupported roster version {} (expected {SCHEMA_VERSION})",
                    doc.version
                )));
            }
            Ok(Decoded {
                layout: Layout::Current {
                    backend: doc.backend,
                    dimension: doc.dimension,
                },
                entries: doc.entries,
                unpaired: 0,
            })
        }
        AnyDocument::Encodings { encodings, student_ids } => {
            Ok(from_parallel("encodings", encodings, student_ids))
        }
        AnyDocument::Embeddings { embeddings, student_ids } => {
            Ok(from_parallel("embeddings", embeddings, student_ids))
        }
    }
}

/// Read a descriptor, turning the `null`s serde_json writes for NaN and
/// infinities back into NaN so validation can drop the entry.
pub(crate) fn lenient_vector<'de, D>(deserializer: D) -> Result<Vec<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Option<f32>> = Vec::deserialize(deserializer)?;
    Ok(nulls_to_nan(raw))
}

fn nulls_to_nan(raw: Vec<Option<f32>>) -> Vec<f32> {
    raw.into_iter().map(|v| v.unwrap_or(f32::NAN)).collect()
}

fn from_parallel(field: &'static str, vectors: Vec<Vec<Option<f32>>>, ids: Vec<String>) -> Decoded {
    let unpaired = vectors.len().abs_diff(ids.len());
    if unpaired > 0 {
        tracing::warn!(
            field,
            vectors = vectors.len(),
            ids = ids.len(),
            "legacy roster arrays differ in length; keeping the common prefix"
        );
    }

    let entries = ids
        .into_iter()
        .zip(vectors)
        .map(|(identity, descriptor)| RosterEntry {
            identity,
            descriptor: nulls_to_nan(descriptor),
            enrolled_at: None,
        })
        .collect();

    Decoded {
        layout: Layout::Legacy(field),
        entries,
        unpaired,
    }
}

pub fn encode(
    backend: &str,
    dimension: usize,
    entries: &[RosterEntry],
) -> Result<Vec<u8>, StorageError> {
    let doc = RosterDocument {
        version: SCHEMA_VERSION,
        backend: backend.to_string(),
        dimension,
        entries: entries.to_vec(),
    };
    serde_json::to_vec_pretty(&doc)
        .map_err(|e| StorageError::Corrupt(format!("encoding roster: {e}")))
}

/// What the validation pass threw away.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub wrong_dimension: usize,
    pub non_finite: usize,
    /// Identities that are empty or unsafe to use as artifact file names.
    pub invalid_identity: usize,
    /// Earlier entries superseded by a later one with the same identity.
    pub superseded: usize,
}

impl ValidationReport {
    pub fn dropped(&self) -> usize {
        self.wrong_dimension + self.non_finite + self.invalid_identity + self.superseded
    }

    pub fn is_clean(&self) -> bool {
        self.dropped() == 0
    }
}

/// Drop entries that cannot be matched against `dimension`-length descriptors.
///
/// When an identity appears more than once the last occurrence wins and
/// takes the earlier one's place, since re-enrollment replaces.
pub fn validate(
    entries: Vec<RosterEntry>,
    dimension: usize,
) -> (Vec<RosterEntry>, ValidationReport) {
    let mut report = ValidationReport::default();
    let mut kept: Vec<RosterEntry> = Vec::with_capacity(entries.len());
    let mut position: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        if let Err(e) = validate_identity(&entry.identity) {
            tracing::warn!(error = %e, "dropping roster entry with invalid identity");
            report.invalid_identity += 1;
            continue;
        }
        if entry.descriptor.len() != dimension {
            tracing::warn!(
                identity = %entry.identity,
                len = entry.descriptor.len(),
                expected = dimension,
                "dropping roster entry with wrong descriptor length"
            );
            report.wrong_dimension += 1;
            continue;
        }
        if entry.descriptor.iter().any(|v| !v.is_finite()) {
            tracing::warn!(
                identity = %entry.identity,
                "dropping roster entry with non-finite values"
            );
            report.non_finite += 1;
            continue;
        }

        match position.get(&entry.identity) {
            Some(&i) => {
                report.superseded += 1;
                kept[i] = entry;
            }
            None => {
                position.insert(entry.identity.clone(), kept.len());
                kept.push(entry);
            }
        }
    }

    (kept, report)
}

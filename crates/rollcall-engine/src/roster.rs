//! The roster store: identity → descriptor, one entry per identity.
//!
//! Readers take a [`snapshot`](RosterStore::snapshot), an `Arc` of an
//! immutable roster, and never block mutations for longer than a pointer
//! swap. Mutations go through a [`RosterWriter`], which holds the store's
//! mutation lock for its whole lifetime. Each mutation builds the next
//! roster, writes it to the backend and only then publishes it, so a failed
//! write leaves both the durable and the in-memory roster untouched.

use chrono::{DateTime, Utc};
use rollcall_core::Backend;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::EngineError;
use crate::schema::{self, Layout};
use crate::storage::RosterBackend;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub identity: String,
    #[serde(deserialize_with = "schema::lenient_vector")]
    pub descriptor: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<DateTime<Utc>>,
}

impl RosterEntry {
    pub fn new(identity: impl Into<String>, descriptor: Vec<f32>) -> Self {
        Self {
            identity: identity.into(),
            descriptor,
            enrolled_at: Some(Utc::now()),
        }
    }
}

/// Entries in insertion order. Re-enrolled identities move to the end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.get(identity).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.iter()
    }

    pub fn identities(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.identity.clone()).collect()
    }

    fn position(&self, identity: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.identity == identity)
    }
}

pub struct RosterStore {
    backend: Box<dyn RosterBackend>,
    backend_id: String,
    dimension: usize,
    current: RwLock<Arc<Roster>>,
    mutation: Mutex<()>,
}

impl RosterStore {
    /// Load the roster for descriptors from `active`.
    ///
    /// A missing document is an empty roster. Legacy layouts are upgraded
    /// and invalid entries dropped; either way the corrected roster is
    /// written back before the store is handed out. A document written by
    /// a different backend is refused.
    pub fn open(backend: Box<dyn RosterBackend>, active: &Backend) -> Result<Self, EngineError> {
        let location = backend.location();
        let mut entries = Vec::new();
        let mut needs_rewrite = false;

        if let Some(bytes) = backend.load()? {
            let decoded = schema::decode(&bytes)?;
            if let Layout::Current { backend: ref recorded, .. } = decoded.layout {
                if recorded != &active.id {
                    return Err(EngineError::ForeignRoster {
                        recorded: recorded.clone(),
                        active: active.id.clone(),
                    });
                }
            }
            if decoded.is_legacy() {
                tracing::info!(
                    %location,
                    layout = ?decoded.layout,
                    "upgrading legacy roster document"
                );
            }
            needs_rewrite = decoded.is_legacy() || decoded.unpaired > 0;

            let (kept, report) = schema::validate(decoded.entries, active.dimension);
            if !report.is_clean() {
                tracing::warn!(
                    %location,
                    dropped = report.dropped(),
                    wrong_dimension = report.wrong_dimension,
                    non_finite = report.non_finite,
                    invalid_identity = report.invalid_identity,
                    superseded = report.superseded,
                    "dropped invalid roster entries"
                );
                needs_rewrite = true;
            }
            entries = kept;
        }

        let store = Self {
            backend,
            backend_id: active.id.clone(),
            dimension: active.dimension,
            current: RwLock::new(Arc::new(Roster { entries })),
            mutation: Mutex::new(()),
        };

        if needs_rewrite {
            let roster = store.snapshot();
            store.persist(&roster)?;
            tracing::info!(%location, entries = roster.len(), "rewrote corrected roster");
        }

        tracing::info!(
            %location,
            backend = %store.backend_id,
            entries = store.snapshot().len(),
            "roster loaded"
        );
        Ok(store)
    }

    /// The current roster. Never observes a half-applied mutation.
    pub fn snapshot(&self) -> Arc<Roster> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Take the mutation lock. Blocks while another writer is alive.
    pub fn writer(&self) -> RosterWriter<'_> {
        let guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        RosterWriter { store: self, _guard: guard }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    fn persist(&self, roster: &Roster) -> Result<(), EngineError> {
        let bytes = schema::encode(&self.backend_id, self.dimension, &roster.entries)?;
        self.backend.save(&bytes)?;
        Ok(())
    }

    fn publish(&self, roster: Roster) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(roster);
    }
}

/// Exclusive mutation access to a [`RosterStore`].
///
/// Every method persists before returning `Ok`. Holding one writer across
/// several calls makes them a single critical section.
pub struct RosterWriter<'a> {
    store: &'a RosterStore,
    _guard: MutexGuard<'a, ()>,
}

impl RosterWriter<'_> {
    /// The roster as of the last committed mutation.
    pub fn roster(&self) -> Arc<Roster> {
        self.store.snapshot()
    }

    /// Insert `entry`, replacing any existing entry for the same identity.
    /// Returns whether one was replaced.
    pub fn upsert(&mut self, entry: RosterEntry) -> Result<bool, EngineError> {
        if entry.descriptor.len() != self.store.dimension {
            return Err(EngineError::BackendMismatch {
                expected: format!("{}-d descriptor", self.store.dimension),
                actual: format!("{}-d descriptor", entry.descriptor.len()),
            });
        }
        if entry.descriptor.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::NonFiniteDescriptor);
        }

        let mut next = Roster::clone(&self.roster());
        let replaced = match next.position(&entry.identity) {
            Some(i) => {
                next.entries.remove(i);
                true
            }
            None => false,
        };
        next.entries.push(entry);
        self.commit(next)?;
        Ok(replaced)
    }

    /// Remove `identity`. Returns whether it was present; absence is not an error.
    pub fn remove(&mut self, identity: &str) -> Result<bool, EngineError> {
        let current = self.roster();
        let Some(i) = current.position(identity) else {
            return Ok(false);
        };
        let mut next = Roster::clone(&current);
        next.entries.remove(i);
        self.commit(next)?;
        Ok(true)
    }

    /// Relabel `from` as `to`, keeping its descriptor and roster position.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), EngineError> {
        let current = self.roster();
        let Some(i) = current.position(from) else {
            return Err(EngineError::NotFound(from.to_string()));
        };
        if from == to {
            return Ok(());
        }
        if current.contains(to) {
            return Err(EngineError::Conflict(to.to_string()));
        }
        let mut next = Roster::clone(&current);
        next.entries[i].identity = to.to_string();
        self.commit(next)
    }

    /// Remove every entry. Returns how many there were.
    pub fn clear(&mut self) -> Result<usize, EngineError> {
        let count = self.roster().len();
        if count > 0 {
            self.commit(Roster::default())?;
        }
        Ok(count)
    }

    fn commit(&mut self, next: Roster) -> Result<(), EngineError> {
        self.store.persist(&next)?;
        self.store.publish(next);
        Ok(())
    }
}

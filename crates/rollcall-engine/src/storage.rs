//! Durable roster storage.
//!
//! A backend stores the whole roster as one opaque blob. The only thing the
//! roster store relies on is that `save` replaces the blob atomically: a
//! reader sees the old document or the new one, never a mix.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("reading roster {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("writing roster {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("roster document is corrupt: {0}")]
    Corrupt(String),
    #[error("roster write rejected: {0}")]
    WriteRejected(String),
}

impl StorageError {
    /// Failed writes leave the previous roster in force and can be retried;
    /// a roster that cannot be read at all cannot.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::Write { .. } | StorageError::WriteRejected(_))
    }
}

/// Load-all / save-all blob store for the roster document.
pub trait RosterBackend: Send + Sync {
    /// The stored document, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Atomically replace the stored document.
    fn save(&self, document: &[u8]) -> Result<(), StorageError>;

    /// Where the roster lives, for log messages.
    fn location(&self) -> String;
}

/// Roster kept in a single file, replaced via write-to-temp + rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "roster".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_err(&self, source: io::Error) -> StorageError {
        StorageError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl RosterBackend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&self, document: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.write_err(e))?;
        }

        let tmp = self.temp_path();
        let result = File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(document)?;
                f.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &self.path));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(self.write_err(e));
        }

        // The new document is already visible, so failing here would
        // report a mutation as lost that readers can see.
        if let Err(e) = sync_parent(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to sync roster directory"
            );
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Flush the directory entry for `path` so a completed rename survives a crash.
fn sync_parent(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

/// In-process backend. Clones share the same document, so a test can keep
/// a handle to inspect what was persisted or to make writes fail.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    document: Arc<Mutex<Option<Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded with an existing document.
    pub fn with_document(document: impl Into<Vec<u8>>) -> Self {
        let backend = Self::default();
        if let Ok(mut slot) = backend.document.lock() {
            *slot = Some(document.into());
        }
        backend
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The currently persisted document.
    pub fn document(&self) -> Option<Vec<u8>> {
        self.document.lock().ok().and_then(|d| d.clone())
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RosterBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let slot = self
            .document
            .lock()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(slot.clone())
    }

    fn save(&self, document: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected("memory backend set to fail writes".into()));
        }
        let mut slot = self
            .document
            .lock()
            .map_err(|e| StorageError::WriteRejected(e.to_string()))?;
        *slot = Some(document.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

//! Durable allocator state.
//!
//! State for every host lives in one JSON document, rewritten whole on each
//! save through a temporary file and a rename. Processes sharing the document
//! serialize read-modify-write cycles on an advisory file lock.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::slot::SlotState;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persists allocator state around every mutation.
///
/// `transact` refreshes from durable state, calls `mutate` at most once, then
/// saves, so every process sharing a store sees the others' changes. When it
/// fails before calling `mutate`, the caller applies the change unsaved.
pub trait StateSink: Send + Sync {
    fn transact(&self, mutate: &mut dyn FnMut()) -> Result<(), PersistError>;
}

/// On-disk document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub hosts: BTreeMap<String, SlotState>,
}

/// JSON file holding [`PersistedState`].
///
/// Writers coordinate through an advisory lock on a sibling `.lock` file; the
/// document itself is replaced by rename, so readers never see a partial write.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

/// Exclusive lock on a [`StateFile`], released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sibling("lock")
    }

    /// Where an unreadable document is moved by [`read_or_quarantine`](Self::read_or_quarantine).
    pub fn quarantine_path(&self) -> PathBuf {
        self.sibling("corrupt")
    }

    /// Block until this process holds the exclusive lock.
    pub fn lock(&self) -> Result<StateLock, PersistError> {
        let path = self.lock_path();
        let lock_err = |source| PersistError::Lock {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(self.dir()).map_err(lock_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;
        FileExt::lock_exclusive(&file).map_err(lock_err)?;
        Ok(StateLock { file })
    }

    /// Read the document. A missing file is `Ok(None)`.
    pub fn read(&self) -> Result<Option<PersistedState>, PersistError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Read the document, moving an unreadable one aside and starting empty.
    pub fn read_or_quarantine(&self) -> Option<PersistedState> {
        match self.read() {
            Ok(document) => document,
            Err(e) => {
                let moved_to = self.quarantine_path();
                tracing::warn!(
                    path = %self.path.display(),
                    moved_to = %moved_to.display(),
                    error = %e,
                    "Discarding unreadable allocator state"
                );
                if let Err(e) = std::fs::rename(&self.path, &moved_to)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    tracing::warn!(error = %e, "Failed to move unreadable state file aside");
                }
                None
            }
        }
    }

    pub fn write(&self, hosts: BTreeMap<String, SlotState>) -> Result<(), PersistError> {
        let document = PersistedState {
            saved_at: Utc::now(),
            hosts,
        };
        let json = serde_json::to_vec_pretty(&document)?;

        let dir = self.dir();
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::trace!(path = %self.path.display(), "Saved allocator state");
        Ok(())
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "displot-state".into());
        name.push(".");
        name.push(extension);
        self.path.with_file_name(name)
    }
}

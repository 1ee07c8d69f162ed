//! Viewer-scoped override persistence. After an optimistic action the server
//! keeps returning stale vote/save fields until it has processed the write;
//! the override store masks those fields across reloads until the server
//! confirms.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;

use crate::entity::EntityRef;
use crate::reconciler::VoteValue;

pub const VOTE_OVERRIDE_PREFIX: &str = "overrides:vote:";
pub const SAVE_OVERRIDE_PREFIX: &str = "overrides:save:";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io failure: {0}")]
    Io(#[from] io::Error),
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("failed to encode storage image: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Synchronous string key/value persistence, the client-side analog of
/// browser local storage.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Write-through JSON file storage surviving restarts.
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Open or create the backing file. A missing file starts empty, and a
    /// corrupted image is discarded so it cannot lock the client out.
    pub fn open(path: impl Into<PathBuf>) -> Result<FileStorage, StorageError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("discarding unreadable storage image at {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(FileStorage {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string(entries)?;
        fs::write(&self.path, raw)?;

        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        entries.insert(key.to_owned(), value.to_owned());
        // A failed flush keeps the in-memory value: the optimistic state is
        // still honored for this run, it just will not survive a reload.
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.flush(&entries)
    }
}

/// In-memory backend with an optional byte quota, used in tests and as an
/// ephemeral fallback. The quota models the hard write limit of browser
/// local storage.
#[derive(Default)]
pub struct MemoryStorage {
    quota_bytes: Option<usize>,
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    pub fn with_quota(quota_bytes: usize) -> MemoryStorage {
        MemoryStorage {
            quota_bytes: Some(quota_bytes),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn used_bytes(entries: &HashMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        if let Some(quota) = self.quota_bytes {
            let existing = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let projected = Self::used_bytes(&entries) - existing + key.len() + value.len();
            if projected > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        entries.insert(key.to_owned(), value.to_owned());

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .remove(key);

        Ok(())
    }
}

/// Typed layer over a [`StorageBackend`] owning key formation and the sparse
/// storage invariant: a neutral vote or an unsaved flag is deleted, never
/// stored. Backend failures only cost reload durability, so they are logged
/// and swallowed here and callers never observe them.
#[derive(Clone)]
pub struct OverrideStore {
    backend: Arc<dyn StorageBackend>,
}

impl OverrideStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> OverrideStore {
        OverrideStore { backend }
    }

    /// The stored vote override, or no vote when absent or unreadable.
    pub fn vote(&self, entity: EntityRef, viewer_id: i64) -> VoteValue {
        match self.backend.get(&vote_key(entity, viewer_id)) {
            Some(raw) => raw
                .parse::<i64>()
                .map(VoteValue::from_int)
                .unwrap_or_default(),
            None => VoteValue::None,
        }
    }

    pub fn set_vote(&self, entity: EntityRef, viewer_id: i64, value: VoteValue) {
        let key = vote_key(entity, viewer_id);
        let result = if value == VoteValue::None {
            self.backend.remove(&key)
        } else {
            self.backend.set(&key, &value.as_int().to_string())
        };
        if let Err(e) = result {
            warn!("override write for {key} failed: {e}");
        }
    }

    /// Whether a save override is stored. Presence is the value: only
    /// `saved = true` ever occupies storage.
    pub fn saved(&self, entity: EntityRef, viewer_id: i64) -> bool {
        self.backend.get(&save_key(entity, viewer_id)).is_some()
    }

    pub fn set_saved(&self, entity: EntityRef, viewer_id: i64, saved: bool) {
        let key = save_key(entity, viewer_id);
        let result = if saved {
            self.backend.set(&key, "1")
        } else {
            self.backend.remove(&key)
        };
        if let Err(e) = result {
            warn!("override write for {key} failed: {e}");
        }
    }
}

fn vote_key(entity: EntityRef, viewer_id: i64) -> String {
    format!(
        "{VOTE_OVERRIDE_PREFIX}{viewer_id}:{}:{}",
        entity.kind.as_str(),
        entity.id
    )
}

fn save_key(entity: EntityRef, viewer_id: i64) -> String {
    format!(
        "{SAVE_OVERRIDE_PREFIX}{viewer_id}:{}:{}",
        entity.kind.as_str(),
        entity.id
    )
}

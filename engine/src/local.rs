//! Local replica: the device's durable copy of the collection.
//!
//! The replica is best-effort. Loading never fails (missing or corrupt data
//! reads as an empty collection) and saving reports failure as `false`, so a
//! broken local cache can never take down the sync path.

use crate::{error::Result, session::UserKey, Collection};
use dashmap::DashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A string key-value store that survives restarts.
pub trait LocalStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory [`LocalStore`].
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: DashMap<String, String>,
    read_only: std::sync::atomic::AtomicBool,
}

impl MemoryLocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every write fail, as a full or revoked disk would.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only
            .store(read_only, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::Error::Storage("store is read-only".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.entries.remove(key);
        Ok(())
    }
}

/// [`LocalStore`] keeping one file per key in a directory.
///
/// File names are the hex-encoded key, so distinct keys never share a file.
/// Each write goes to its own temporary file that is then renamed over the
/// target, so a crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    dir: PathBuf,
}

impl FileLocalStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key.as_bytes())))
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(value.as_bytes())?;
        file.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Loads and saves a user's collection in a [`LocalStore`].
#[derive(Clone)]
pub struct LocalReplica {
    store: Arc<dyn LocalStore>,
    prefix: String,
}

impl LocalReplica {
    /// Create a replica storing entries under `prefix` + user key.
    pub fn new(store: Arc<dyn LocalStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Storage key for a user namespace.
    pub fn storage_key(&self, user: &UserKey) -> String {
        format!("{}{}", self.prefix, user)
    }

    /// Load the collection. Missing or corrupt data yields an empty collection.
    pub fn load(&self, user: &UserKey) -> Collection {
        let key = self.storage_key(user);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Collection::new(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Local collection unreadable");
                return Collection::new();
            }
        };

        match Collection::from_json(&raw) {
            Ok(collection) => collection,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Local collection corrupt, treating as empty");
                Collection::new()
            }
        }
    }

    /// Save the collection. Returns `false` when the write failed.
    pub fn save(&self, user: &UserKey, collection: &Collection) -> bool {
        let key = self.storage_key(user);
        let written = collection
            .to_json()
            .and_then(|json| self.store.set(&key, &json));

        match written {
            Ok(()) => {
                tracing::debug!(key = %key, items = collection.len(), "Local collection saved");
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Local collection write failed");
                false
            }
        }
    }

    /// Delete the stored collection. Returns `false` when the delete failed.
    pub fn clear(&self, user: &UserKey) -> bool {
        let key = self.storage_key(user);
        match self.store.remove(&key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Local collection delete failed");
                false
            }
        }
    }
}

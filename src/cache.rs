//! Persistent caches for word indexes and the pairwise match memo.
//!
//! Values are serialized as JSON documents and keyed by a content hash of
//! the inputs they were derived from, so a new text revision never hits a
//! stale entry. Cache failures are soft: an unreadable or corrupt entry is
//! logged and rebuilt, and a failed write only costs the next run a rebuild.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use xxhash_rust::xxh64::Xxh64;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity of a cached value: a label plus a hash of its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(label: &str, hash: u64) -> Self {
        let label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        CacheKey(format!("{}-{:016x}", label, hash))
    }

    /// Key derived from the full content of one line sequence.
    pub fn for_text<S: AsRef<str>>(label: &str, lines: &[S]) -> Self {
        let mut hasher = Xxh64::new(0);
        hash_lines(&mut hasher, lines);
        CacheKey::new(label, hasher.digest())
    }

    /// Key for a per-text structure that also depends on the verse list and
    /// the range marker.
    pub fn for_index<S: AsRef<str>>(label: &str, marker: &str, verse_refs: &[String], lines: &[S]) -> Self {
        let mut hasher = Xxh64::new(0);
        hasher.update(marker.as_bytes());
        hasher.update(b"\x1e");
        hash_lines(&mut hasher, verse_refs);
        hasher.update(b"\x1e");
        hash_lines(&mut hasher, lines);
        CacheKey::new(label, hasher.digest())
    }

    /// Key derived from an ordered pair of texts, the verse list they are
    /// aligned to and the range marker they are condensed with.
    pub fn for_pair<S: AsRef<str>>(
        label: &str,
        marker: &str,
        verse_refs: &[String],
        source: &[S],
        target: &[S],
    ) -> Self {
        let mut hasher = Xxh64::new(0);
        hasher.update(marker.as_bytes());
        hasher.update(b"\x1e");
        hash_lines(&mut hasher, verse_refs);
        hasher.update(b"\x1e");
        hash_lines(&mut hasher, source);
        hasher.update(b"\x1e");
        hash_lines(&mut hasher, target);
        CacheKey::new(label, hasher.digest())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn hash_lines<S: AsRef<str>>(hasher: &mut Xxh64, lines: &[S]) {
    hasher.update(&(lines.len() as u64).to_le_bytes());
    for line in lines {
        hasher.update(line.as_ref().as_bytes());
        hasher.update(b"\n");
    }
}

/// Raw byte storage behind a [`Cache`].
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` when no entry exists for `key`.
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;
    fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError>;
}

/// One JSON document per key under a directory, written atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(JsonFileStore { dir })
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CacheStore for JsonFileStore {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        // Write next to the destination, then rename over it
        let mut temp_file = NamedTempFile::new_in(&self.dir)?;
        temp_file.write_all(bytes)?;
        temp_file.flush()?;
        temp_file
            .persist(self.path_for(key))
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<CacheKey, Vec<u8>>>,
}

impl CacheStore for MemoryStore {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

/// Typed cache over a [`CacheStore`].
///
/// Each key has its own reader/writer lock: loads share it, while a rebuild
/// or an update holds it exclusively, so readers never observe a rebuild of
/// the same key half-way. A key's lock lives only while some caller holds
/// it, so the lock table stays bounded by the keys in use.
pub struct Cache<S: CacheStore> {
    store: S,
    locks: Mutex<HashMap<CacheKey, Arc<RwLock<()>>>>,
}

impl<S: CacheStore> Cache<S> {
    pub fn new(store: S) -> Self {
        Cache {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop `lock`, then forget every key no caller holds anymore.
    fn release(&self, lock: Arc<RwLock<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, l| Arc::strong_count(l) > 1);
    }

    /// Return the cached value for `key` unless `refresh` is set or no
    /// usable entry exists, in which case `build` runs and its result
    /// overwrites the entry.
    pub fn get_or_build<T, F>(&self, key: &CacheKey, refresh: bool, build: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let lock = self.lock_for(key);
        let value = self.get_or_build_locked(&lock, key, refresh, build);
        self.release(lock);
        value
    }

    fn get_or_build_locked<T, F>(&self, lock: &RwLock<()>, key: &CacheKey, refresh: bool, build: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        if !refresh {
            let _shared = lock.read().unwrap_or_else(|e| e.into_inner());
            if let Some(value) = self.read_entry(key) {
                debug!(key = key.as_str(), "cache hit");
                return value;
            }
        }

        let _exclusive = lock.write().unwrap_or_else(|e| e.into_inner());

        // Another writer may have filled the entry while we waited
        if !refresh {
            if let Some(value) = self.read_entry(key) {
                debug!(key = key.as_str(), "cache hit after wait");
                return value;
            }
        }

        debug!(key = key.as_str(), refresh, "cache rebuild");
        let value = build();
        self.write_entry(key, &value);
        value
    }

    /// Load the value for `key` (or start from `T::default()`), let `update`
    /// modify it, then persist it. The key is held exclusively throughout.
    pub fn update<T, R, F>(&self, key: &CacheKey, refresh: bool, update: F) -> R
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let lock = self.lock_for(key);
        let result = {
            let _exclusive = lock.write().unwrap_or_else(|e| e.into_inner());

            let mut value = if refresh {
                T::default()
            } else {
                self.read_entry(key).unwrap_or_default()
            };

            let result = update(&mut value);
            self.write_entry(key, &value);
            result
        };
        self.release(lock);
        result
    }

    /// Typed load; any failure is reported as `None` after logging it.
    fn read_entry<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        match self.try_read(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "discarding unusable cache entry");
                None
            }
        }
    }

    fn try_read<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let Some(bytes) = self.store.load(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key: key.as_str().to_string(),
                reason: e.to_string(),
            })
    }

    fn write_entry<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let result = serde_json::to_vec(value)
            .map_err(CacheError::from)
            .and_then(|bytes| self.store.store(key, &bytes));

        if let Err(e) = result {
            warn!(key = key.as_str(), error = %e, "failed to persist cache entry");
        }
    }
}

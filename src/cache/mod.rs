//! Persistent fingerprint-keyed cache
//!
//! Each cache domain keeps one slot per key. An entry is only served when the
//! caller's content fingerprint matches the one stored with it; any mismatch is
//! a miss and the next insert overwrites the slot, which keeps the cache
//! bounded by the number of distinct keys rather than by edit history.
//!
//! The whole map lives in memory and is written to
//! `<cache_dir>/<name>.bin` by [`PersistentCache::persist`]. Writes go to a
//! temporary file that is renamed over the old one, so an interrupted write
//! leaves the previous file intact. A missing, corrupt or stale-version file
//! loads as an empty cache.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::Result;

/// Cache file extension
const CACHE_EXT: &str = "bin";

/// Content digest used as the validity check for a cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint raw content bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<V> {
    fingerprint: Fingerprint,
    value: V,
}

/// On-disk layout
#[derive(Serialize, Deserialize)]
struct CacheFile<V> {
    /// Crate version that wrote the file; other versions start empty
    version: String,
    entries: HashMap<String, CacheEntry<V>>,
}

/// Hit/miss counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// A named, fingerprint-validated key/value store that survives restarts
pub struct PersistentCache<V> {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> std::fmt::Debug for PersistentCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("path", &self.path)
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V> PersistentCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Open the cache domain `name` under `cache_dir`, loading any previous contents
    pub fn open(cache_dir: &Path, name: &str) -> Self {
        let path = cache_dir.join(format!("{}.{}", name, CACHE_EXT));
        let entries = Self::load(&path);
        debug!(cache = name, entries = entries.len(), "opened persistent cache");
        Self::with_entries(path, entries)
    }

    /// A cache that starts empty and persists to `path`
    pub fn empty(path: PathBuf) -> Self {
        Self::with_entries(path, HashMap::new())
    }

    fn with_entries(path: PathBuf, entries: HashMap<String, CacheEntry<V>>) -> Self {
        Self {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn load(path: &Path) -> HashMap<String, CacheEntry<V>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return HashMap::new(),
        };
        match bincode::deserialize::<CacheFile<V>>(&bytes) {
            Ok(file) if file.version == crate::VERSION => file.entries,
            Ok(file) => {
                debug!(path = %path.display(), version = %file.version, "discarding cache written by another version");
                HashMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache file is corrupt, starting empty");
                HashMap::new()
            }
        }
    }

    /// Look up `key`, returning the value only if it was stored with `fingerprint`
    pub fn get(&self, key: &str, fingerprint: &Fingerprint) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.fingerprint == *fingerprint => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` for `key`, replacing whatever the slot held before
    pub fn insert(&self, key: String, fingerprint: Fingerprint, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, CacheEntry { fingerprint, value });
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Drop the slot for `key`
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole map to disk if anything changed since the last persist
    pub fn persist(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let bytes = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            bincode::serialize(&CacheFile {
                version: crate::VERSION.to_string(),
                entries: entries.clone(),
            })?
        };

        let result = write_atomically(&self.path, &bytes);
        if result.is_err() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        result
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

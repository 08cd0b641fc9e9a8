//! Discovery cache - last known-good backend with a time-to-live
//!
//! The cached address is a hint, never a verdict: `Discoverer` re-probes it
//! before use. Storage problems degrade to "no cache" and are only logged.
//!
//! There is no cross-process locking. One discoverer runs per client, so
//! the plain read-modify-write access is enough.

use parking_lot::Mutex;
use sage_core::{BackendInfo, CACHE_KEY, CacheEntry, DEFAULT_CACHE_TTL, now_millis};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error at {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("cache record at {0} is not valid UTF-8")]
    Corrupt(PathBuf),

    #[error("invalid cache key '{0}'")]
    InvalidKey(String),

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key-value storage for one named entry at a time.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn store(&self, key: &str, value: &str) -> Result<(), CacheError>;
    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process storage, for tests and embedders without a writable disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl CacheStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per entry under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$SAGE_HOME/cache`, falling back to `~/.sage/cache`.
    pub fn default_location() -> Result<Self, std::io::Error> {
        Ok(Self::new(sage_home_dir()?.join("cache")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl CacheStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.path_for(key)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(path, e)),
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| CacheError::Corrupt(path))
    }

    fn store(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| CacheError::Io(self.dir.clone(), e))?;
        // Write-then-rename so a crash never leaves half a record behind.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(|e| CacheError::Io(tmp.clone(), e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CacheError::Io(path.clone(), e))
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(path, e)),
        }
    }
}

/// SAGE's per-user state directory.
pub fn sage_home_dir() -> Result<PathBuf, std::io::Error> {
    if let Ok(v) = std::env::var("SAGE_HOME")
        && !v.trim().is_empty()
    {
        return Ok(PathBuf::from(v));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        )
    })?;

    Ok(home.join(".sage"))
}

/// TTL-bounded view over a [`CacheStore`]. Sole writer of the entry.
pub struct DiscoveryCache {
    store: Box<dyn CacheStore>,
    key: String,
    ttl: Duration,
}

impl DiscoveryCache {
    pub fn new(store: Box<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            key: CACHE_KEY.to_string(),
            ttl,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()), DEFAULT_CACHE_TTL)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached entry, if present and younger than the TTL.
    pub fn read(&self) -> Option<CacheEntry> {
        self.read_at(now_millis())
    }

    /// [`DiscoveryCache::read`] against an explicit clock (unix millis).
    /// Expired and unparseable records are deleted on the way out.
    pub fn read_at(&self, now_ms: u64) -> Option<CacheEntry> {
        let raw = match self.store.load(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e @ CacheError::Corrupt(_)) => {
                tracing::warn!("Discarding corrupt discovery cache entry: {}", e);
                self.delete();
                return None;
            }
            Err(e) => {
                tracing::warn!("Discovery cache unavailable: {}", e);
                return None;
            }
        };

        let entry = match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Discarding corrupt discovery cache entry: {}", e);
                self.delete();
                return None;
            }
        };

        if !entry.is_fresh(now_ms, self.ttl.as_millis() as u64) {
            tracing::debug!(
                url = %entry.backend.url,
                age_ms = now_ms.saturating_sub(entry.cached_at),
                "Discovery cache entry expired"
            );
            self.delete();
            return None;
        }

        Some(entry)
    }

    pub fn write(&self, backend: &BackendInfo) {
        self.write_at(backend, now_millis());
    }

    /// Persist `backend` as cached at `now_ms`, replacing any prior entry.
    pub fn write_at(&self, backend: &BackendInfo, now_ms: u64) {
        let entry = CacheEntry {
            backend: backend.clone(),
            cached_at: now_ms,
        };
        let result = serde_json::to_string(&entry)
            .map_err(CacheError::from)
            .and_then(|json| self.store.store(&self.key, &json));
        if let Err(e) = result {
            tracing::warn!(url = %backend.url, "Failed to persist discovery cache: {}", e);
        }
    }

    /// Drop the entry unconditionally, e.g. after a failed live re-check.
    pub fn invalidate(&self) {
        self.delete();
    }

    fn delete(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            tracing::warn!("Failed to remove discovery cache entry: {}", e);
        }
    }
}

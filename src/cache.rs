//! Two-tier (memory + disk) cache for lookup results.
//!
//! Layout on disk: one file per key, named after the SHA-256 of the key,
//! plus a `metadata.json` sidecar mapping keys to [`EntryMetadata`].
//! Payloads are JSON, gzip-compressed once they exceed the configured
//! threshold (detected on read by the gzip magic number).
//!
//! Reads never fail: I/O errors, corrupt payloads and expired entries all
//! come back as a miss. Writes surface [`TrackerError::Cache`].

use crate::config::CacheConfig;
use crate::error::{Result, TrackerError};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

const METADATA_FILE: &str = "metadata.json";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Which tier(s) an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    Memory,
    Disk,
    All,
}

impl CacheLevel {
    fn memory(self) -> bool {
        matches!(self, CacheLevel::Memory | CacheLevel::All)
    }

    fn disk(self) -> bool {
        matches!(self, CacheLevel::Disk | CacheLevel::All)
    }
}

/// Eviction priority; lower priorities are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub priority: Priority,
    /// Bytes as stored (after compression, for the disk tier)
    pub size_bytes: u64,
    pub source: String,
    #[serde(default)]
    pub compressed: bool,
}

impl EntryMetadata {
    fn new(priority: Priority, size_bytes: u64, source: &str) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_accessed: now,
            access_count: 0,
            priority,
            size_bytes,
            source: source.to_string(),
            compressed: false,
        }
    }

    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.created_at > ttl,
            Err(_) => false,
        }
    }

    fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }

    fn eviction_key(&self) -> (Priority, DateTime<Utc>) {
        (self.priority, self.last_accessed)
    }
}

/// Sizing and expiry knobs for a [`TieredCache`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl: Duration,
    pub max_memory_items: usize,
    pub max_disk_bytes: u64,
    pub compression_threshold: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            default_ttl: config.ttl(),
            max_memory_items: config.max_memory_items,
            max_disk_bytes: config.max_disk_bytes,
            compression_threshold: config.compression_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

struct MemoryEntry {
    payload: Vec<u8>,
    meta: EntryMetadata,
}

#[derive(Default)]
struct Inner {
    memory: HashMap<String, MemoryEntry>,
    disk: HashMap<String, EntryMetadata>,
    disk_bytes: u64,
    /// Keys whose disk payload failed to parse this session
    corrupt: HashSet<String>,
    metadata_dirty: bool,
    hits: u64,
    misses: u64,
}

/// Memory + disk cache shared by every component of a run.
pub struct TieredCache {
    dir: PathBuf,
    settings: CacheSettings,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("dir", &self.dir)
            .field("settings", &self.settings)
            .finish()
    }
}

fn cache_err(context: &str, path: &Path, err: impl std::fmt::Display) -> TrackerError {
    TrackerError::Cache(format!("{} {}: {}", context, path.display(), err))
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
}

impl TieredCache {
    /// Open (or create) a cache rooted at `dir`, loading the metadata sidecar.
    ///
    /// An unreadable sidecar is discarded rather than treated as fatal.
    pub fn open(dir: impl Into<PathBuf>, settings: CacheSettings) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| cache_err("cannot create", &dir, e))?;

        let mut inner = Inner::default();
        let metadata_path = dir.join(METADATA_FILE);
        if metadata_path.exists() {
            match std::fs::read(&metadata_path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<HashMap<String, EntryMetadata>>(&bytes)
                        .map_err(|e| e.to_string())
                }) {
                Ok(entries) => {
                    for (key, meta) in entries {
                        if Self::entry_path_in(&dir, &key).exists() {
                            inner.disk_bytes += meta.size_bytes;
                            inner.disk.insert(key, meta);
                        } else {
                            inner.metadata_dirty = true;
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %metadata_path.display(), error = %e, "discarding unreadable cache metadata");
                    inner.metadata_dirty = true;
                }
            }
        }

        debug!(dir = %dir.display(), entries = inner.disk.len(), "opened cache");
        Ok(Self {
            dir,
            settings,
            inner: Mutex::new(inner),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::open(config.resolved_directory(), CacheSettings::from(config))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry_path_in(dir: &Path, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        dir.join(format!("{:x}.cache", digest))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        Self::entry_path_in(&self.dir, key)
    }

    /// Look up `key`. `ttl` defaults to the configured TTL.
    ///
    /// A disk hit with `level == All` is promoted into memory.
    pub fn get<T: DeserializeOwned>(&self, key: &str, level: CacheLevel, ttl: Option<Duration>) -> Option<T> {
        let ttl = ttl.unwrap_or(self.settings.default_ttl);
        let now = Utc::now();
        let mut inner = self.lock();

        if level.memory() {
            let expired = inner.memory.get(key).map(|e| e.meta.is_expired(ttl, now));
            match expired {
                Some(true) => {
                    debug!(key, "memory entry expired");
                    inner.memory.remove(key);
                }
                Some(false) => {
                    let value = inner.memory.get_mut(key).and_then(|entry| {
                        entry.meta.touch();
                        serde_json::from_slice::<T>(&entry.payload).ok()
                    });
                    if value.is_some() {
                        // Keep disk eviction order in step with memory use.
                        if let Some(meta) = inner.disk.get_mut(key) {
                            meta.touch();
                            inner.metadata_dirty = true;
                        }
                        inner.hits += 1;
                        return value;
                    }
                }
                None => {}
            }
        }

        if level.disk() {
            if let Some((payload, value)) = self.read_disk::<T>(&mut inner, key, ttl, now) {
                if let Some(meta) = inner.disk.get_mut(key) {
                    meta.touch();
                    inner.metadata_dirty = true;
                }
                if level == CacheLevel::All
                    && let Some(meta) = inner.disk.get(key).cloned()
                {
                    let meta = EntryMetadata {
                        size_bytes: payload.len() as u64,
                        compressed: false,
                        ..meta
                    };
                    inner.memory.insert(key.to_string(), MemoryEntry { payload, meta });
                    self.evict_memory(&mut inner);
                }
                inner.hits += 1;
                return Some(value);
            }
        }

        inner.misses += 1;
        None
    }

    /// Read and decode a disk entry; returns the raw JSON payload as well for promotion.
    fn read_disk<T: DeserializeOwned>(
        &self,
        inner: &mut Inner,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<(Vec<u8>, T)> {
        if inner.corrupt.contains(key) {
            return None;
        }
        let meta = inner.disk.get(key)?;
        let path = self.entry_path(key);

        if meta.is_expired(ttl, now) {
            debug!(key, "disk entry expired");
            if let Err(e) = self.remove_disk_entry(inner, key) {
                warn!(key, error = %e, "failed to remove expired cache entry");
            }
            return None;
        }

        let stored = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(key, error = %e, "cache file unreadable");
                return None;
            }
        };

        let payload = if is_gzip(&stored) {
            let mut decoded = Vec::new();
            if let Err(e) = GzDecoder::new(stored.as_slice()).read_to_end(&mut decoded) {
                warn!(key, error = %e, "corrupt compressed cache payload");
                inner.corrupt.insert(key.to_string());
                return None;
            }
            decoded
        } else {
            stored
        };

        let json: serde_json::Value = match serde_json::from_slice(&payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "corrupt cache payload");
                inner.corrupt.insert(key.to_string());
                return None;
            }
        };

        // A shape mismatch is a miss for this caller, not corruption.
        let value = serde_json::from_value(json).ok()?;
        Some((payload, value))
    }

    /// Store `value` under `key` in the requested tier(s).
    pub fn put<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        level: CacheLevel,
        priority: Priority,
        source: &str,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| TrackerError::Cache(format!("cannot serialize {}: {}", key, e)))?;
        let mut inner = self.lock();

        if level.disk() {
            let (stored, compressed) = if payload.len() > self.settings.compression_threshold {
                (self.compress(key, &payload)?, true)
            } else {
                (payload.clone(), false)
            };

            let path = self.entry_path(key);
            write_atomic(&path, &stored).map_err(|e| cache_err("cannot write", &path, e))?;

            let mut meta = EntryMetadata::new(priority, stored.len() as u64, source);
            meta.compressed = compressed;
            if let Some(old) = inner.disk.insert(key.to_string(), meta) {
                inner.disk_bytes = inner.disk_bytes.saturating_sub(old.size_bytes);
            }
            inner.disk_bytes += stored.len() as u64;
            inner.corrupt.remove(key);
            inner.metadata_dirty = true;

            self.evict_disk(&mut inner)?;
            self.save_metadata(&mut inner)?;
        }

        if level.memory() {
            let meta = EntryMetadata::new(priority, payload.len() as u64, source);
            inner.memory.insert(key.to_string(), MemoryEntry { payload, meta });
            self.evict_memory(&mut inner);
        }

        Ok(())
    }

    fn compress(&self, key: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload)
            .and_then(|_| encoder.finish())
            .map_err(|e| TrackerError::Cache(format!("cannot compress {}: {}", key, e)))
    }

    /// Return the cached value, or run `producer` once, store its result and return it.
    ///
    /// A failure to store the produced value is logged, not returned: the
    /// caller still gets the value it paid for.
    pub fn get_or_set<T, F>(
        &self,
        key: &str,
        producer: F,
        level: CacheLevel,
        ttl: Option<Duration>,
        priority: Priority,
        source: &str,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if let Some(cached) = self.get(key, level, ttl) {
            return Ok(cached);
        }
        let value = producer()?;
        if let Err(e) = self.put(key, &value, level, priority, source) {
            warn!(key, error = %e, "failed to cache produced value");
        }
        Ok(value)
    }

    /// Remove `key` from both tiers. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        let in_memory = inner.memory.remove(key).is_some();
        let on_disk = inner.disk.contains_key(key);
        inner.corrupt.remove(key);
        if on_disk {
            self.remove_disk_entry(&mut inner, key)?;
            self.save_metadata(&mut inner)?;
        }
        Ok(in_memory || on_disk)
    }

    /// Remove all entries, or only those whose `source` matches. Returns the
    /// number of distinct keys removed.
    pub fn clear(&self, source: Option<&str>) -> Result<usize> {
        let mut inner = self.lock();
        let matches = |meta: &EntryMetadata| source.is_none_or(|s| meta.source == s);

        let mut removed: HashSet<String> = inner
            .memory
            .iter()
            .filter(|(_, e)| matches(&e.meta))
            .map(|(k, _)| k.clone())
            .collect();
        inner.memory.retain(|_, e| !matches(&e.meta));

        let disk_keys: Vec<String> = inner
            .disk
            .iter()
            .filter(|(_, m)| matches(m))
            .map(|(k, _)| k.clone())
            .collect();
        for key in disk_keys {
            self.remove_disk_entry(&mut inner, &key)?;
            removed.insert(key);
        }
        if source.is_none() {
            inner.corrupt.clear();
        }
        self.save_metadata(&mut inner)?;

        debug!(?source, removed = removed.len(), "cleared cache");
        Ok(removed.len())
    }

    /// Drop every entry in both tiers.
    pub fn invalidate(&self) -> Result<()> {
        self.clear(None).map(|_| ())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            memory_entries: inner.memory.len(),
            disk_entries: inner.disk.len(),
            disk_bytes: inner.disk_bytes,
        }
    }

    /// Metadata of the disk entry for `key`, if present.
    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.lock().disk.get(key).cloned()
    }

    /// Persist access-time updates gathered by `get`.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        self.save_metadata(&mut inner)
    }

    fn remove_disk_entry(&self, inner: &mut Inner, key: &str) -> Result<()> {
        if let Some(meta) = inner.disk.remove(key) {
            inner.disk_bytes = inner.disk_bytes.saturating_sub(meta.size_bytes);
            inner.metadata_dirty = true;
        }
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cache_err("cannot remove", &path, e)),
        }
    }

    fn evict_memory(&self, inner: &mut Inner) {
        while inner.memory.len() > self.settings.max_memory_items {
            let Some(victim) = inner
                .memory
                .iter()
                .min_by_key(|(_, e)| e.meta.eviction_key())
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!(key = %victim, "evicting from memory");
            inner.memory.remove(&victim);
        }
    }

    fn evict_disk(&self, inner: &mut Inner) -> Result<()> {
        while inner.disk_bytes > self.settings.max_disk_bytes {
            let Some(victim) = inner
                .disk
                .iter()
                .min_by_key(|(_, m)| m.eviction_key())
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!(key = %victim, "evicting from disk");
            self.remove_disk_entry(inner, &victim)?;
        }
        Ok(())
    }

    fn save_metadata(&self, inner: &mut Inner) -> Result<()> {
        if !inner.metadata_dirty {
            return Ok(());
        }
        let path = self.dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(&inner.disk)
            .map_err(|e| TrackerError::Cache(format!("cannot serialize metadata: {}", e)))?;
        write_atomic(&path, &json).map_err(|e| cache_err("cannot write", &path, e))?;
        inner.metadata_dirty = false;
        Ok(())
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to persist cache metadata");
        }
    }
}

/// Write through a temporary file so readers never see a partial payload.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

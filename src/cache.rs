//! Multi-tier caching: an in-memory LRU plus a persistent on-disk store.
//!
//! Both tiers are backed by sharded concurrent maps, so readers and
//! writers on different keys never contend on a global lock and writes to
//! one key are serialized by its shard. Compound operations (memory miss
//! → disk read → memory insert) are idempotent, so races between readers
//! at worst repeat work. Disk writes are atomic (temp file + rename) and
//! always best-effort: a failed disk write degrades to memory-only, never
//! errors.

use crate::analyzer::content_hash;
use crate::config::CacheConfig;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Size estimation
// ---------------------------------------------------------------------------

/// Estimated in-memory footprint: 2× the UTF-16 length of the serialized
/// value. Unserializable values get a flat floor so accounting never stalls.
pub fn estimate_size<V: Serialize>(value: &V) -> usize {
    serde_json::to_string(value).map(|s| s.encode_utf16().count() * 2).unwrap_or(64)
}

// ---------------------------------------------------------------------------
// In-memory LRU
// ---------------------------------------------------------------------------

struct CacheEntry<V> {
    value: V,
    size: usize,
    /// Access order: the smallest sequence number is least recently used.
    seq: u64,
    inserted: Instant,
}

/// Strict LRU bounded by bytes and entry count, with optional TTL.
/// Access promotes; eviction removes the least recently used entry until
/// both bounds hold. Entries live in a sharded map, with the access
/// counter and byte total as atomics beside it.
pub struct LruCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    next_seq: AtomicU64,
    /// Signed: replacement races may transiently dip below zero, which
    /// must not read as overflow.
    total_bytes: AtomicI64,
    max_bytes: usize,
    max_entries: usize,
    ttl: Option<Duration>,
}

impl<V: Clone + Serialize> LruCache<V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            total_bytes: AtomicI64::new(0),
            max_bytes: config.max_bytes,
            max_entries: config.max_entries,
            ttl: config.ttl,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let size = estimate_size(&value);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry { value, size, seq, inserted: Instant::now() };
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_bytes.fetch_sub(old.size as i64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size as i64, Ordering::Relaxed);
        self.evict_overflow();
    }

    pub fn get(&self, key: &str) -> Option<V> {
        // The read guard must drop before any removal touches the shard.
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => self.ttl.is_some_and(|ttl| entry.inserted.elapsed() > ttl),
        };
        if expired {
            self.remove(key);
            return None;
        }

        // Promote to most recently used.
        let mut entry = self.entries.get_mut(key)?;
        entry.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, old)) => {
                self.total_bytes.fetch_sub(old.size as i64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed).max(0) as usize
    }

    fn evict_overflow(&self) {
        loop {
            let over = self.entries.len() > self.max_entries
                || self.total_bytes.load(Ordering::Relaxed) > self.max_bytes as i64;
            if !over {
                break;
            }
            // Owned key so no shard guard is held across the removal.
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().seq)
                .map(|entry| entry.key().clone());
            let Some(key) = victim else { break };
            self.remove(&key);
        }
    }
}

// ---------------------------------------------------------------------------
// Persistent store
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone)]
struct DiskIndexEntry {
    file: String,
    /// Epoch milliseconds of the write.
    timestamp: i64,
    size: u64,
}

const DISK_INDEX_FILE: &str = "cache-index.json";

/// On-disk K/V store with a warm in-memory layer. Each key maps to a JSON
/// file named by the first 16 hex chars of SHA-256(key); `cache-index.json`
/// tracks filename, timestamp, and size per key. The live index is a
/// sharded map; the file on disk is its sorted snapshot.
pub struct PersistentCache {
    dir: PathBuf,
    ttl: Option<Duration>,
    memory: LruCache<serde_json::Value>,
    index: DashMap<String, DiskIndexEntry>,
}

impl PersistentCache {
    /// Opens the store, creating the directory and loading any existing
    /// index. A corrupt index file is discarded and rebuilt over time.
    pub fn open(dir: PathBuf, config: &CacheConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(DISK_INDEX_FILE);
        let loaded: BTreeMap<String, DiskIndexEntry> = match fs::read_to_string(&index_path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt cache index, starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self {
            dir,
            ttl: config.ttl,
            memory: LruCache::new(config),
            index: loaded.into_iter().collect(),
        })
    }

    pub fn set<V: Serialize>(&self, key: &str, value: &V) {
        let json = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "unserializable cache value, skipping");
                return;
            }
        };
        self.memory.insert(key, json.clone());

        // Disk tier is best-effort.
        let file = format!("{}.json", content_hash(key.as_bytes()));
        let body = json.to_string();
        if let Err(e) = atomic_write(&self.dir.join(&file), body.as_bytes()) {
            warn!(key, error = %e, "cache disk write failed");
            return;
        }
        self.index.insert(
            key.to_string(),
            DiskIndexEntry {
                file,
                timestamp: chrono::Utc::now().timestamp_millis(),
                size: body.len() as u64,
            },
        );
        self.write_index();
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        if let Some(json) = self.memory.get(key) {
            return serde_json::from_value(json).ok();
        }

        let entry = self.index.get(key).map(|e| e.value().clone())?;
        if self.entry_expired(&entry) {
            self.delete(key);
            return None;
        }

        let data = fs::read_to_string(self.dir.join(&entry.file)).ok()?;
        let json: serde_json::Value = serde_json::from_str(&data).ok()?;
        // Disk hit warms the memory tier.
        self.memory.insert(key, json.clone());
        serde_json::from_value(json).ok()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.memory.remove(key);
        match self.index.remove(key) {
            Some((_, entry)) => {
                let _ = fs::remove_file(self.dir.join(&entry.file));
                self.write_index();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        if self.memory.get(key).is_some() {
            return true;
        }
        self.index.get(key).is_some_and(|e| !self.entry_expired(e.value()))
    }

    /// Sweep expired entries, delete their files, and rewrite the index.
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let expired: Vec<(String, String)> = self
            .index
            .iter()
            .filter(|e| self.entry_expired(e.value()))
            .map(|e| (e.key().clone(), e.value().file.clone()))
            .collect();
        if expired.is_empty() {
            return 0;
        }
        for (key, file) in &expired {
            self.index.remove(key);
            self.memory.remove(key);
            let _ = fs::remove_file(self.dir.join(file));
        }
        self.write_index();
        debug!(removed = expired.len(), "cache cleanup sweep");
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn entry_expired(&self, entry: &DiskIndexEntry) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age_ms = chrono::Utc::now().timestamp_millis() - entry.timestamp;
                age_ms > ttl.as_millis() as i64
            }
            None => false,
        }
    }

    fn write_index(&self) {
        // Sorted snapshot so the on-disk index is deterministic.
        let snapshot: BTreeMap<String, DiskIndexEntry> = self
            .index
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let body = serde_json::to_string(&snapshot).expect("index entries are serializable");
        if let Err(e) = atomic_write(&self.dir.join(DISK_INDEX_FILE), body.as_bytes()) {
            warn!(error = %e, "cache index write failed");
        }
    }
}

/// Write via temp file + rename so readers never observe a torn value.
pub fn atomic_write(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small_config(max_entries: usize) -> CacheConfig {
        CacheConfig { max_bytes: 1024 * 1024, max_entries, ttl: None, cache_dir: None }
    }

    #[test]
    fn get_after_set_returns_value() {
        let cache: LruCache<String> = LruCache::new(&small_config(8));
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert!(cache.remove("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache: LruCache<u32> = LruCache::new(&small_config(3));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        // Touch `a` so `b` becomes the eviction candidate.
        cache.get("a");
        cache.insert("d", 4);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.get("d"), Some(4));
    }

    #[test]
    fn byte_bound_evicts() {
        let config = CacheConfig {
            max_bytes: 60,
            max_entries: 100,
            ttl: None,
            cache_dir: None,
        };
        let cache: LruCache<String> = LruCache::new(&config);
        cache.insert("a", "aaaaaaaaaa".to_string());
        cache.insert("b", "bbbbbbbbbb".to_string());
        cache.insert("c", "cccccccccc".to_string());
        assert!(cache.total_bytes() <= 60);
        assert!(cache.len() < 3);
    }

    #[test]
    fn ttl_expires_entries() {
        let config = CacheConfig {
            max_bytes: 1024,
            max_entries: 8,
            ttl: Some(Duration::from_millis(0)),
            cache_dir: None,
        };
        let cache: LruCache<u32> = LruCache::new(&config);
        cache.insert("k", 7);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn concurrent_readers_and_writers_settle() {
        let cache: std::sync::Arc<LruCache<u64>> =
            std::sync::Arc::new(LruCache::new(&small_config(128)));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = std::sync::Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let key = format!("k{}", i % 16);
                        cache.insert(key.clone(), t * 1000 + i);
                        let _ = cache.get(&key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.len() <= 16);
        for i in 0..16u64 {
            assert!(cache.get(&format!("k{i}")).is_some());
        }
    }

    #[test]
    fn persistent_round_trip_and_disk_warm() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default();
        let cache = PersistentCache::open(dir.path().to_path_buf(), &config).unwrap();
        cache.set("alpha", &vec![1u32, 2, 3]);

        // A fresh handle must read through disk.
        let reopened = PersistentCache::open(dir.path().to_path_buf(), &config).unwrap();
        let value: Vec<u32> = reopened.get("alpha").unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        // Entry file is named by the key hash.
        let expected = format!("{}.json", content_hash(b"alpha"));
        assert!(dir.path().join(expected).exists());
        assert!(dir.path().join(DISK_INDEX_FILE).exists());
    }

    #[test]
    fn persistent_delete_removes_entry_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path().to_path_buf(), &CacheConfig::default()).unwrap();
        cache.set("k", &"v");
        assert!(cache.delete("k"));
        assert!(!cache.contains("k"));
        let file = format!("{}.json", content_hash(b"k"));
        assert!(!dir.path().join(file).exists());
    }

    #[test]
    fn cleanup_sweeps_expired() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            ttl: Some(Duration::from_millis(0)),
            ..CacheConfig::default()
        };
        let cache = PersistentCache::open(dir.path().to_path_buf(), &config).unwrap();
        cache.set("old", &1u32);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn corrupt_index_recovers_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DISK_INDEX_FILE), "{{{not json").unwrap();
        let cache = PersistentCache::open(dir.path().to_path_buf(), &CacheConfig::default()).unwrap();
        assert!(cache.is_empty());
    }
}

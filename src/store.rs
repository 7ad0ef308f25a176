//! Persistent, size-bounded analysis cache.
//!
//! Each entry lives in its own storage record under
//! `storage_prefix + CacheKey::encode()`, so tabs writing different keys never
//! overwrite each other and same-key writes are last-writer-wins. Storage is
//! read on every lookup; there is no in-memory copy that could go stale when a
//! sibling tab writes.
//!
//! # Failure handling
//! Caching is best-effort. Storage errors are logged and swallowed:
//! - unreadable or corrupted records count as misses and are removed,
//! - a full quota triggers one extra eviction and a single retry,
//! - any other write failure drops the entry; the caller keeps its result.
//!
//! # Counters
//! Hits and misses are counted per store instance (one per tab) and reset by
//! [`CacheStore::clear`].

use crate::clock::{Clock, Millis};
use crate::config::CacheConfig;
use crate::fingerprint::CacheKey;
use crate::storage::{KeyValueStorage, StorageError};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::marker::PhantomData;
use std::rc::Rc;

/// A cached analysis result with its LRU bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<R> {
    pub key: CacheKey,
    pub result: R,
    pub created_at: Millis,
    pub last_accessed_at: Millis,
}

/// Borrowed form written by `put`, so the caller keeps ownership of the result.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryRecord<'a, R> {
    key: &'a CacheKey,
    result: &'a R,
    created_at: Millis,
    last_accessed_at: Millis,
}

/// Timestamps only; lets eviction scan records without decoding results.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryTimes {
    created_at: Millis,
    last_accessed_at: Millis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before the first lookup.
    pub hit_rate: f64,
    pub oldest_entry: Option<Millis>,
    pub newest_entry: Option<Millis>,
}

pub struct CacheStore<R> {
    storage: Rc<dyn KeyValueStorage>,
    clock: Rc<dyn Clock>,
    config: CacheConfig,
    hits: Cell<u64>,
    misses: Cell<u64>,
    last_stamp: Cell<Millis>,
    _result: PhantomData<fn() -> R>,
}

impl<R> CacheStore<R>
where
    R: Serialize + DeserializeOwned,
{
    pub fn new(
        storage: Rc<dyn KeyValueStorage>,
        clock: Rc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            config,
            hits: Cell::new(0),
            misses: Cell::new(0),
            last_stamp: Cell::new(Millis::MIN),
            _result: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity.get()
    }

    fn storage_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.config.storage_prefix, key.encode())
    }

    /// Current time, bumped so stamps issued by this store strictly increase.
    fn stamp(&self) -> Millis {
        let now = self.clock.now_ms();
        let last = self.last_stamp.get();
        let stamp = if now > last { now } else { last.saturating_add(1) };
        self.last_stamp.set(stamp);
        stamp
    }

    fn read_entry(&self, storage_key: &str, key: &CacheKey) -> Option<CacheEntry<R>> {
        let raw = match self.storage.get_item(storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache read failed for {}: {}", storage_key, e);
                return None;
            }
        };
        match serde_json::from_str::<CacheEntry<R>>(&raw) {
            Ok(entry) if entry.key == *key => Some(entry),
            Ok(_) => {
                warn!("Cache record {} does not match its key, dropping", storage_key);
                self.discard(storage_key);
                None
            }
            Err(e) => {
                warn!("Corrupted cache record {}: {}", storage_key, e);
                self.discard(storage_key);
                None
            }
        }
    }

    fn discard(&self, storage_key: &str) {
        if let Err(e) = self.storage.remove_item(storage_key) {
            debug!("Could not remove cache record {}: {}", storage_key, e);
        }
    }

    /// Look up an entry. A hit refreshes its recency; absence is not an error.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<R>> {
        let storage_key = self.storage_key(key);
        let Some(mut entry) = self.read_entry(&storage_key, key) else {
            self.misses.set(self.misses.get() + 1);
            return None;
        };

        entry.last_accessed_at = self.stamp();
        let record = EntryRecord {
            key: &entry.key,
            result: &entry.result,
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
        };
        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self.storage.set_item(&storage_key, &json) {
                    debug!("Could not refresh recency of {}: {}", storage_key, e);
                }
            }
            Err(e) => debug!("Could not re-encode {}: {}", storage_key, e),
        }

        self.hits.set(self.hits.get() + 1);
        Some(entry)
    }

    /// Read an entry without touching recency or counters.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<R>> {
        self.read_entry(&self.storage_key(key), key)
    }

    /// Insert or overwrite, evicting least-recently-accessed entries when full.
    pub fn put(&self, key: &CacheKey, result: &R) {
        let storage_key = self.storage_key(key);
        let now = self.stamp();
        let record = EntryRecord { key, result, created_at: now, last_accessed_at: now };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                warn!("Cannot encode analysis result for {}: {}", storage_key, e);
                return;
            }
        };

        let is_new = !matches!(self.storage.get_item(&storage_key), Ok(Some(_)));
        if is_new {
            self.evict_down_to(self.capacity() - 1, &storage_key);
        }

        match self.storage.set_item(&storage_key, &json) {
            Ok(()) => debug!("Cached analysis {}", storage_key),
            Err(StorageError::QuotaExceeded) => {
                if self.evict_oldest(&storage_key) {
                    if let Err(e) = self.storage.set_item(&storage_key, &json) {
                        warn!("Cache write failed after eviction for {}: {}", storage_key, e);
                    }
                } else {
                    warn!("Cache quota exceeded and nothing left to evict for {}", storage_key);
                }
            }
            Err(e) => warn!("Cache write failed for {}: {}", storage_key, e),
        }
    }

    /// Storage keys and timestamps of every readable entry. Corrupted records are dropped.
    fn live_records(&self) -> Vec<(String, EntryTimes)> {
        let keys = match self.storage.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cannot enumerate cache records: {}", e);
                return Vec::new();
            }
        };

        keys.into_iter()
            .filter(|k| k.starts_with(&self.config.storage_prefix))
            .filter_map(|k| {
                let raw = self.storage.get_item(&k).ok().flatten()?;
                match serde_json::from_str::<EntryTimes>(&raw) {
                    Ok(times) => Some((k, times)),
                    Err(e) => {
                        warn!("Corrupted cache record {}: {}", k, e);
                        self.discard(&k);
                        None
                    }
                }
            })
            .collect()
    }

    fn lru_position(records: &[(String, EntryTimes)]) -> Option<usize> {
        records
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let rank = |(key, times): &(String, EntryTimes)| {
                    (times.last_accessed_at, times.created_at, key.clone())
                };
                rank(a).cmp(&rank(b))
            })
            .map(|(i, _)| i)
    }

    fn evict_down_to(&self, limit: usize, keep: &str) {
        let mut records = self.live_records();
        records.retain(|(k, _)| k != keep);
        while records.len() > limit {
            let Some(pos) = Self::lru_position(&records) else { break };
            let (victim, _) = records.swap_remove(pos);
            debug!("Evicting least recently used cache entry {}", victim);
            self.discard(&victim);
        }
    }

    fn evict_oldest(&self, keep: &str) -> bool {
        let mut records = self.live_records();
        records.retain(|(k, _)| k != keep);
        match Self::lru_position(&records) {
            Some(pos) => {
                self.discard(&records[pos].0);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.live_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every decodable entry, oldest first.
    pub fn entries(&self) -> Vec<CacheEntry<R>> {
        let mut entries: Vec<CacheEntry<R>> = self
            .live_records()
            .into_iter()
            .filter_map(|(k, _)| {
                let raw = self.storage.get_item(&k).ok().flatten()?;
                serde_json::from_str(&raw).ok()
            })
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub fn stats(&self) -> CacheStatistics {
        let records = self.live_records();
        let hits = self.hits.get();
        let misses = self.misses.get();
        let lookups = hits + misses;
        CacheStatistics {
            size: records.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            oldest_entry: records.iter().map(|(_, t)| t.created_at).min(),
            newest_entry: records.iter().map(|(_, t)| t.created_at).max(),
        }
    }

    /// Remove every entry and reset the hit/miss counters.
    pub fn clear(&self) {
        match self.storage.keys() {
            Ok(keys) => keys
                .iter()
                .filter(|k| k.starts_with(&self.config.storage_prefix))
                .for_each(|k| self.discard(k)),
            Err(e) => warn!("Cannot enumerate cache records to clear: {}", e),
        }
        self.hits.set(0);
        self.misses.set(0);
    }
}

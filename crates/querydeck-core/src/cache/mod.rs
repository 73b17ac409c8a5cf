//! Result cache
//!
//! Byte-budgeted store of materialized result sets keyed by
//! [`cache_key`]. Eviction is by insertion order (oldest first), not by
//! access recency: `get` never reorders, and re-`put`ting a key moves it to
//! the back of the queue. The capacity is a soft budget. An entry larger
//! than the whole cache is still stored after everything else is evicted.
//!
//! ```text
//!   put(k4) ──► [k1 k2 k3] + k4 > capacity
//!               evict k1, k2 ... until it fits or empty
//!               [k3 k4]
//! ```

mod key;

pub use key::{cache_key, normalize_sql};

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::error::Error;
use crate::result::ResultSet;

/// Default capacity: 100 MiB
pub const DEFAULT_MAX_SIZE_BYTES: usize = 100 * 1024 * 1024;

/// One cached result, as listed by [`ResultCache::entries`]
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Cached result
    pub data: ResultSet,
    /// When the entry was (re)inserted
    pub inserted_at: DateTime<Utc>,
    /// Estimated footprint
    pub size_bytes: usize,
    /// Insertion sequence number, lower is older
    sequence: u64,
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// `get` calls that found an entry
    pub hits: u64,
    /// `get` calls that found nothing
    pub misses: u64,
    /// Successful `put` calls
    pub inserts: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Inserts of entries larger than the whole capacity
    pub oversize_inserts: u64,
    /// Live entries
    pub entries: usize,
    /// Bytes currently accounted
    pub current_size_bytes: usize,
    /// Configured capacity
    pub max_size_bytes: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    current_size_bytes: usize,
    next_sequence: u64,
    stats: CacheStats,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.sequence);
        self.current_size_bytes = self.current_size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.current_size_bytes = self.current_size_bytes.saturating_sub(entry.size_bytes);
            self.stats.evictions += 1;
            tracing::debug!(key = %key, size_bytes = entry.size_bytes, "evicted cached result");
        }
        true
    }
}

/// Byte-budgeted FIFO result cache
pub struct ResultCache {
    max_size_bytes: usize,
    state: Mutex<CacheState>,
}

impl ResultCache {
    /// Create a cache with the given capacity in bytes
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            max_size_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Create from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size_bytes)
    }

    /// Insert or replace `key`
    pub fn put(&self, key: impl Into<String>, result: ResultSet) {
        let key = key.into();
        let size_bytes = result.estimated_size_bytes();
        let mut state = self.state.lock();

        if state.remove(&key).is_some() {
            tracing::trace!(key = %key, "replacing cached result");
        }

        while state.current_size_bytes + size_bytes > self.max_size_bytes {
            if !state.evict_oldest() {
                break;
            }
        }

        if size_bytes > self.max_size_bytes {
            state.stats.oversize_inserts += 1;
            let err = Error::CacheCapacityExceeded {
                required: size_bytes,
                capacity: self.max_size_bytes,
            };
            tracing::warn!(key = %key, "{}", err);
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.order.insert(sequence, key.clone());
        state.current_size_bytes += size_bytes;
        state.stats.inserts += 1;
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                data: result,
                inserted_at: Utc::now(),
                size_bytes,
                sequence,
            },
        );
    }

    /// Copy of the cached result, if any. Does not affect eviction order.
    pub fn get(&self, key: &str) -> Option<ResultSet> {
        let mut state = self.state.lock();
        let found = state.entries.get(key).map(|e| e.data.clone());
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        found
    }

    /// Whether `key` is cached, without touching hit/miss counters
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &str) {
        if self.state.lock().remove(key).is_some() {
            tracing::debug!(key = %key, "invalidated cached result");
        }
    }

    /// Drop every entry belonging to one connection; returns how many were removed
    pub fn invalidate_connection(&self, connection_identity: &str) -> usize {
        let prefix = key::connection_prefix(connection_identity);
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.current_size_bytes = 0;
    }

    /// Bytes currently accounted
    pub fn current_size_bytes(&self) -> usize {
        self.state.lock().current_size_bytes
    }

    /// Configured capacity
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of the live entries, oldest first (next to be evicted first)
    pub fn entries(&self) -> Vec<CacheEntry> {
        let state = self.state.lock();
        state
            .order
            .values()
            .filter_map(|key| state.entries.get(key).cloned())
            .collect()
    }

    /// Snapshot of counters
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            current_size_bytes: state.current_size_bytes,
            max_size_bytes: self.max_size_bytes,
            ..state.stats.clone()
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE_BYTES)
    }
}

//! Durable content cache
//!
//! Resolved content is cached per logical coordinate in a [`KvStore`] as a
//! JSON [`CacheEntry`] `{ content, timestamp }`. Entries older than the TTL
//! are treated as absent and removed on lookup. Every storage failure (full,
//! unavailable, corrupt entry) is logged and degrades to a miss.

use std::sync::Arc;
use std::time::Duration;

use folio_core::{Clock, Coordinate, ResolvedContent, SystemClock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::StorageError;
use crate::kv::KvStore;
use crate::quota::{EvictionCandidate, QuotaManager};

/// Key prefix for cache entries
pub const CACHE_KEY_PREFIX: &str = "folio:cache:";

/// Cache configuration, supplied by the settings surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are treated as absent
    pub ttl: Duration,
    /// Maximum number of cached coordinates
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_entries: 512,
        }
    }
}

/// Stored form of a cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: ResolvedContent,
    /// When the entry was written (unix seconds)
    pub timestamp: u64,
}

/// Result of a cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    /// A new or different record was stored
    Written,
    /// The same record is already cached; nothing was written
    Unchanged,
    /// The store refused the write
    Failed,
}

/// TTL-bounded content cache keyed by coordinate
pub struct ContentCache {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    quota: QuotaManager,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("config", &self.config)
            .field("quota", &self.quota)
            .finish()
    }
}

impl ContentCache {
    pub fn new(kv: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self::with_clock(kv, config, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: Arc<dyn KvStore>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let quota = QuotaManager::new(config.max_entries);
        Self {
            kv,
            clock,
            config,
            quota,
        }
    }

    /// Replace the quota manager (eviction policy)
    pub fn with_quota(mut self, quota: QuotaManager) -> Self {
        self.quota = quota;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn key(coord: &Coordinate) -> String {
        format!("{CACHE_KEY_PREFIX}{}", coord.storage_key())
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        now >= entry.timestamp.saturating_add(self.config.ttl.as_secs())
    }

    fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        match self.kv.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn discard(&self, key: &str) {
        if let Err(e) = self.kv.remove(key) {
            warn!(key, error = %e, "Failed to remove cache entry");
        }
    }

    /// Look up fresh content for a coordinate
    pub fn get(&self, coord: &Coordinate) -> Option<ResolvedContent> {
        let key = Self::key(coord);
        let entry = match self.read_entry(&key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(StorageError::Deserialization(e)) => {
                warn!(coordinate = %coord, error = %e, "Discarding corrupt cache entry");
                self.discard(&key);
                return None;
            }
            Err(e) => {
                warn!(coordinate = %coord, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        if self.is_expired(&entry, self.clock.now_unix()) {
            debug!(coordinate = %coord, cached_at = entry.timestamp, "Cache entry expired");
            self.discard(&key);
            return None;
        }

        trace!(coordinate = %coord, record = %entry.content.record_id, "Cache hit");
        Some(entry.content)
    }

    /// Store content, skipping the write when the same record is already cached
    pub fn put(&self, content: &ResolvedContent) -> CacheWrite {
        let key = Self::key(&content.coordinate);
        let now = self.clock.now_unix();

        let existing = self.read_entry(&key).ok().flatten();
        if let Some(existing) = &existing
            && existing.content.record_id == content.record_id
            && !self.is_expired(existing, now)
        {
            trace!(coordinate = %content.coordinate, "Cache already holds this record");
            return CacheWrite::Unchanged;
        }
        if existing.is_none() {
            self.make_room();
        }

        let entry = CacheEntry {
            content: content.clone(),
            timestamp: now,
        };
        let result = serde_json::to_string(&entry)
            .map_err(StorageError::from)
            .and_then(|raw| self.kv.set(&key, &raw));

        match result {
            Ok(()) => {
                debug!(coordinate = %content.coordinate, record = %content.record_id, "Cached content");
                CacheWrite::Written
            }
            Err(e) => {
                warn!(coordinate = %content.coordinate, error = %e, "Cache write failed");
                CacheWrite::Failed
            }
        }
    }

    /// Record id currently cached for a coordinate, ignoring TTL
    pub fn cached_record(&self, coord: &Coordinate) -> Option<folio_core::RecordId> {
        self.read_entry(&Self::key(coord))
            .ok()
            .flatten()
            .map(|e| e.content.record_id)
    }

    fn make_room(&self) {
        let keys = match self.kv.keys_with_prefix(CACHE_KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list cache entries for eviction");
                return;
            }
        };
        let to_evict = self.quota.entries_to_evict(keys.len(), 1);
        if to_evict == 0 {
            return;
        }

        let candidates: Vec<EvictionCandidate> = keys
            .into_iter()
            .map(|key| match self.read_entry(&key) {
                Ok(Some(entry)) => EvictionCandidate {
                    key,
                    cached_at: entry.timestamp,
                    created_at: entry.content.created_at,
                },
                // unreadable entries go first
                _ => EvictionCandidate {
                    key,
                    cached_at: 0,
                    created_at: 0,
                },
            })
            .collect();

        for key in self.quota.select_for_eviction(&candidates, to_evict) {
            debug!(key = %key, "Evicted cache entry due to quota");
            self.discard(&key);
        }
    }

    pub fn remove(&self, coord: &Coordinate) {
        self.discard(&Self::key(coord));
    }

    /// Remove every cache entry
    pub fn clear(&self) -> usize {
        match self.kv.keys_with_prefix(CACHE_KEY_PREFIX) {
            Ok(keys) => {
                let count = keys.len();
                for key in keys {
                    self.discard(&key);
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "Failed to clear cache");
                0
            }
        }
    }

    /// Remove expired and corrupt entries, returning how many were removed
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now_unix();
        let keys = match self.kv.keys_with_prefix(CACHE_KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list cache entries");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            let stale = match self.read_entry(&key) {
                Ok(Some(entry)) => self.is_expired(&entry, now),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale {
                self.discard(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned cache entries");
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet pruned
    pub fn len(&self) -> usize {
        self.kv
            .keys_with_prefix(CACHE_KEY_PREFIX)
            .map(|k| k.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

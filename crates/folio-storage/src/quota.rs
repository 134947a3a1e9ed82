//! Quota management for storage
//!
//! This module provides quota management and eviction policies
//! for controlling how many entries the content cache keeps.

/// Eviction policy for when the entry limit is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict entries that were cached longest ago (default)
    #[default]
    OldestCached,
    /// Evict entries whose content was created longest ago
    OldestContent,
}

/// An entry that may be evicted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: String,
    /// When the entry was written (unix seconds)
    pub cached_at: u64,
    /// Creation time of the cached content (unix seconds)
    pub created_at: u64,
}

/// Manages storage quotas and eviction
#[derive(Debug, Clone)]
pub struct QuotaManager {
    /// Maximum number of entries
    max_entries: usize,
    /// Eviction policy when limits are reached
    eviction_policy: EvictionPolicy,
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self {
            max_entries: 512,
            eviction_policy: EvictionPolicy::default(),
        }
    }
}

impl QuotaManager {
    /// Create a new QuotaManager with the given entry limit
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            eviction_policy: EvictionPolicy::default(),
        }
    }

    /// Create a QuotaManager with custom eviction policy
    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy
    }

    /// Check if adding an entry would exceed the quota
    pub fn would_exceed(&self, current_count: usize) -> bool {
        current_count >= self.max_entries
    }

    /// Calculate how many entries need to be evicted to fit `to_add` more
    pub fn entries_to_evict(&self, current_count: usize, to_add: usize) -> usize {
        let new_total = current_count.saturating_add(to_add);
        new_total.saturating_sub(self.max_entries)
    }

    /// Apply eviction policy to a set of candidates, returning keys to evict
    pub fn select_for_eviction(
        &self,
        candidates: &[EvictionCandidate],
        count: usize,
    ) -> Vec<String> {
        if count == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let mut ordered: Vec<&EvictionCandidate> = candidates.iter().collect();
        match self.eviction_policy {
            EvictionPolicy::OldestCached => {
                ordered.sort_by(|a, b| a.cached_at.cmp(&b.cached_at).then(a.key.cmp(&b.key)))
            }
            EvictionPolicy::OldestContent => {
                ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)))
            }
        }

        ordered
            .into_iter()
            .take(count.min(candidates.len()))
            .map(|c| c.key.clone())
            .collect()
    }
}

//! Persisted offline queue
//!
//! Ids of records created while no remote node accepted them. The queue is
//! persisted as a single JSON array of id strings under
//! [`OFFLINE_QUEUE_KEY`]; unreadable content loads as an empty queue.
//!
//! Adding an id that is already queued, or removing one that is not, is a
//! no-op.

use std::collections::BTreeSet;
use std::sync::Arc;

use folio_core::RecordId;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::error::StorageError;
use crate::kv::KvStore;

/// Fixed storage key of the persisted queue
pub const OFFLINE_QUEUE_KEY: &str = "folio:offline-queue";

/// Durable set of record ids awaiting remote publication
pub struct OfflineQueue {
    kv: Arc<dyn KvStore>,
    ids: RwLock<BTreeSet<RecordId>>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("ids", &*self.ids.read())
            .finish()
    }
}

impl OfflineQueue {
    /// Create an empty queue; call [`load`](Self::load) to restore state
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            ids: RwLock::new(BTreeSet::new()),
        }
    }

    /// Replace in-memory state with the persisted queue
    ///
    /// Corrupt or unreadable content is treated as an empty queue.
    pub fn load(&self) -> usize {
        let loaded = match self.kv.get(OFFLINE_QUEUE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => ids.into_iter().map(RecordId::new).collect(),
                Err(e) => {
                    warn!(error = %e, "Persisted offline queue is corrupt, starting empty");
                    BTreeSet::new()
                }
            },
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read offline queue, starting empty");
                BTreeSet::new()
            }
        };

        let count = loaded.len();
        *self.ids.write() = loaded;
        info!(queued = count, "Loaded offline queue");
        count
    }

    /// Write the current id set to the store
    pub fn persist(&self) -> Result<(), StorageError> {
        let ids: Vec<String> = self
            .ids
            .read()
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        let raw = serde_json::to_string(&ids)?;
        self.kv.set(OFFLINE_QUEUE_KEY, &raw)?;
        trace!(queued = ids.len(), "Persisted offline queue");
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist offline queue");
        }
    }

    /// Queue an id and persist immediately; returns false if already queued
    pub fn enqueue(&self, id: RecordId) -> bool {
        let added = self.ids.write().insert(id.clone());
        if added {
            debug!(record = %id, "Queued record for later publication");
            self.persist_logged();
        }
        added
    }

    /// Dequeue an id and persist immediately; returns false if absent
    pub fn remove(&self, id: &RecordId) -> bool {
        let removed = self.ids.write().remove(id);
        if removed {
            debug!(record = %id, "Removed record from offline queue");
            self.persist_logged();
        }
        removed
    }

    /// Drop an id from memory without persisting; the caller persists later
    pub fn discard(&self, id: &RecordId) -> bool {
        self.ids.write().remove(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.ids.read().contains(id)
    }

    /// Snapshot of queued ids in order
    pub fn ids(&self) -> Vec<RecordId> {
        self.ids.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn id(n: u8) -> RecordId {
        RecordId::new(format!("{:064x}", n))
    }

    #[test]
    fn test_enqueue_and_remove_are_idempotent() {
        let kv = Arc::new(InMemoryKvStore::new());
        let queue = OfflineQueue::new(kv);
        assert!(queue.enqueue(id(1)));
        assert!(!queue.enqueue(id(1)));
        assert_eq!(queue.len(), 1);
        assert!(queue.remove(&id(1)));
        assert!(!queue.remove(&id(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_survives_restart() {
        let kv = Arc::new(InMemoryKvStore::new());
        let queue = OfflineQueue::new(kv.clone());
        queue.enqueue(id(2));
        queue.enqueue(id(1));

        let restored = OfflineQueue::new(kv.clone());
        assert_eq!(restored.load(), 2);
        assert_eq!(restored.ids(), vec![id(1), id(2)]);

        let raw = kv.get(OFFLINE_QUEUE_KEY).unwrap().unwrap();
        let parsed: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_corrupt_state_loads_empty() {
        let kv = Arc::new(InMemoryKvStore::new());
        kv.set(OFFLINE_QUEUE_KEY, "{\"oops\":").unwrap();
        let queue = OfflineQueue::new(kv.clone());
        assert_eq!(queue.load(), 0);

        kv.set(OFFLINE_QUEUE_KEY, "{\"not\":\"an array\"}").unwrap();
        assert_eq!(queue.load(), 0);
    }

    #[test]
    fn test_persist_failure_keeps_memory_state() {
        let kv = Arc::new(InMemoryKvStore::new());
        let queue = OfflineQueue::new(kv.clone());
        kv.set_unavailable(true);
        assert!(queue.enqueue(id(3)));
        assert!(queue.contains(&id(3)));
        assert!(queue.persist().is_err());
    }
}

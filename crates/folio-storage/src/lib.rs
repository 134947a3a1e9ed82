//! # Folio Storage
//!
//! Local persistence for the Folio sync engine.
//!
//! ## Features
//!
//! - **KvStore trait**: Synchronous key-value persistence seam, with
//!   [`InMemoryKvStore`] and file-backed [`FileKvStore`] implementations
//! - **ContentCache**: Coordinate-keyed content cache with TTL and entry quota
//! - **RecordStore trait**: Local replicated store with point lookups and
//!   timeline subscriptions; [`InMemoryRecordStore`] implements it
//! - **OfflineQueue**: Persisted set of record ids awaiting remote publication
//! - **QuotaManager**: Entry limits with eviction policies
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use folio_storage::{CacheConfig, ContentCache, InMemoryKvStore, OfflineQueue};
//!
//! let kv = Arc::new(InMemoryKvStore::new());
//! let cache = ContentCache::new(kv.clone(), CacheConfig::default());
//! let queue = OfflineQueue::new(kv);
//! queue.load();
//! ```

pub mod cache;
pub mod error;
pub mod kv;
pub mod memory;
pub mod queue;
pub mod quota;

// Re-exports
pub use cache::{CACHE_KEY_PREFIX, CacheConfig, CacheEntry, CacheWrite, ContentCache};
pub use error::StorageError;
pub use kv::{FileKvStore, InMemoryKvStore, KvStore};
pub use memory::InMemoryRecordStore;
pub use queue::{OFFLINE_QUEUE_KEY, OfflineQueue};
pub use quota::{EvictionCandidate, EvictionPolicy, QuotaManager};

use folio_core::{Coordinate, QueryFilter, Record, RecordId, RecordStream};

/// Result of inserting a record into a [`RecordStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was new
    Inserted,
    /// A record with the same id was already stored
    Duplicate,
    /// The record replaced an older version of the same coordinate
    Superseded { previous: RecordId },
    /// A newer version of the same coordinate is already stored
    Stale { current: RecordId },
}

impl InsertOutcome {
    /// Whether the store's contents changed
    pub fn is_stored(&self) -> bool {
        matches!(self, InsertOutcome::Inserted | InsertOutcome::Superseded { .. })
    }
}

/// Local replicated record store
///
/// Lookups are synchronous so the resolution pipeline can answer from local
/// state without suspending.
pub trait RecordStore: Send + Sync {
    /// Point lookup by record id
    fn get(&self, id: &RecordId) -> Option<Record>;

    /// Current version of a replaceable record
    fn get_by_coordinate(&self, coord: &Coordinate) -> Option<Record>;

    /// Insert a record, applying latest-timestamp-wins for replaceable kinds
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be stored (for example an
    /// addressable record without an identifier).
    fn insert(&self, record: Record) -> Result<InsertOutcome, StorageError>;

    /// Current records matching a filter, newest first
    fn query(&self, filter: &QueryFilter) -> Vec<Record>;

    /// The current matching set followed by every later matching insertion
    fn timeline(&self, filter: QueryFilter) -> RecordStream;

    fn len(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{AuthorKey, Kind, Tag, UnsignedRecord};
    use std::sync::Arc;

    /// Test that the RecordStore trait is object-safe
    fn _assert_object_safe(_: &dyn RecordStore) {}

    #[test]
    fn test_insert_outcome_is_stored() {
        assert!(InsertOutcome::Inserted.is_stored());
        assert!(
            InsertOutcome::Superseded {
                previous: RecordId::new("a")
            }
            .is_stored()
        );
        assert!(!InsertOutcome::Duplicate.is_stored());
        assert!(
            !InsertOutcome::Stale {
                current: RecordId::new("a")
            }
            .is_stored()
        );
    }

    #[test]
    fn test_store_behind_trait_object() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let draft = UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::APP_DATA, 1)
            .with_tag(Tag::pair("d", "folio-settings"))
            .with_content("{}");
        let id = draft.compute_id();
        let record = draft.into_record(id, "sig");
        let coord = record.coordinate().unwrap();

        store.insert(record.clone()).unwrap();
        assert_eq!(store.get_by_coordinate(&coord), Some(record));
    }
}

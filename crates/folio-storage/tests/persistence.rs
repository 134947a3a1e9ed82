//! Persistence tests for folio-storage
//!
//! These tests exercise the content cache and offline queue on top of the
//! file-backed key-value store, across simulated process restarts.

use std::sync::Arc;

use folio_core::{
    AuthorKey, Clock, Kind, MockClock, Record, RecordId, ResolvedContent, Tag, UnsignedRecord,
};
use folio_storage::{
    CacheConfig, CacheWrite, ContentCache, FileKvStore, InMemoryRecordStore, KvStore,
    OFFLINE_QUEUE_KEY, OfflineQueue, RecordStore,
};
use tempfile::TempDir;

fn article(ident: &str, ts: u64) -> Record {
    let draft = UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::LONG_FORM, ts)
        .with_tag(Tag::pair("d", ident))
        .with_tag(Tag::pair("title", "Offline reading"))
        .with_content("# Chapter one");
    let id = draft.compute_id();
    draft.into_record(id, "sig")
}

// ============================================================================
// Restart Tests
// ============================================================================

#[test]
fn test_cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let clock = MockClock::new(1_700_000_000);
    let content = ResolvedContent::from_record(&article("post", 10)).unwrap();

    {
        let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(dir.path()).unwrap());
        let cache = ContentCache::with_clock(kv, CacheConfig::default(), Arc::new(clock.clone()));
        assert_eq!(cache.put(&content), CacheWrite::Written);
    }

    let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(dir.path()).unwrap());
    let cache = ContentCache::with_clock(kv, CacheConfig::default(), Arc::new(clock.clone()));
    assert_eq!(cache.get(&content.coordinate), Some(content.clone()));

    // A restart a week later finds nothing usable
    clock.advance(CacheConfig::default().ttl.as_secs());
    assert!(clock.now_unix() > 1_700_000_000);
    assert_eq!(cache.get(&content.coordinate), None);
}

#[test]
fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let first = article("one", 1);
    let second = article("two", 2);

    {
        let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(dir.path()).unwrap());
        let queue = OfflineQueue::new(kv);
        queue.enqueue(first.id.clone());
        queue.enqueue(second.id.clone());
        queue.remove(&first.id);
    }

    let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(dir.path()).unwrap());
    let queue = OfflineQueue::new(kv.clone());
    assert_eq!(queue.load(), 1);
    assert!(queue.contains(&second.id));
    assert!(!queue.contains(&first.id));

    // Corrupt file on disk loads as empty
    kv.set(OFFLINE_QUEUE_KEY, "not json at all").unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(dir.path()).unwrap());
    let queue = OfflineQueue::new(kv);
    assert_eq!(queue.load(), 0);
}

// ============================================================================
// Store + Queue
// ============================================================================

#[test]
fn test_queued_ids_resolve_through_store() {
    let kv: Arc<dyn KvStore> = Arc::new(folio_storage::InMemoryKvStore::new());
    let store = InMemoryRecordStore::new();
    let queue = OfflineQueue::new(kv);

    let kept = article("kept", 1);
    store.insert(kept.clone()).unwrap();
    queue.enqueue(kept.id.clone());
    queue.enqueue(RecordId::new("f".repeat(64)));

    let resolvable: Vec<Record> = queue.ids().iter().filter_map(|id| store.get(id)).collect();
    assert_eq!(resolvable, vec![kept]);
}

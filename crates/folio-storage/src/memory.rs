//! In-memory replicated record store
//!
//! The single always-consistent read model for "what have we seen". Locally
//! authored records and records received from nodes both converge here.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use folio_core::{Coordinate, QueryFilter, Record, RecordId, RecordStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use crate::error::StorageError;
use crate::{InsertOutcome, RecordStore};

/// Capacity of the insertion notification channel
const ADDITIONS_CAPACITY: usize = 1024;

/// In-memory implementation of RecordStore
///
/// Uses `DashMap` for concurrent access. Replaceable records are indexed by
/// coordinate; only the current version of each coordinate is retained.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    /// Map from record id to record
    records: DashMap<RecordId, Record>,
    /// Index: coordinate -> id of the current version
    by_coordinate: DashMap<Coordinate, RecordId>,
    /// Notifies timeline subscribers of stored records
    additions: broadcast::Sender<Record>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (additions, _) = broadcast::channel(ADDITIONS_CAPACITY);
        Self {
            records: DashMap::new(),
            by_coordinate: DashMap::new(),
            additions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn announce(&self, record: Record) {
        // no subscribers is fine
        let _ = self.additions.send(record);
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.get(id).map(|r| r.value().clone())
    }

    fn get_by_coordinate(&self, coord: &Coordinate) -> Option<Record> {
        let id = self.by_coordinate.get(coord)?.value().clone();
        self.get(&id)
    }

    fn insert(&self, record: Record) -> Result<InsertOutcome, StorageError> {
        if self.records.contains_key(&record.id) {
            trace!(record = %record.id, "Record already stored");
            return Ok(InsertOutcome::Duplicate);
        }

        let Some(coord) = record.coordinate() else {
            trace!(record = %record.id, kind = %record.kind, "Storing record");
            self.records.insert(record.id.clone(), record.clone());
            self.announce(record);
            return Ok(InsertOutcome::Inserted);
        };

        if record.kind.is_addressable() && coord.identifier.is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "addressable record {} has no identifier",
                record.id
            )));
        }

        // Holding the coordinate entry serializes competing versions
        let outcome = match self.by_coordinate.entry(coord.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record.id.clone());
                self.records.insert(record.id.clone(), record.clone());
                InsertOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                let current_id = slot.get().clone();
                match self.records.get(&current_id).map(|r| r.value().clone()) {
                    Some(current) if !record.supersedes(&current) => {
                        debug!(
                            coordinate = %coord,
                            record = %record.id,
                            current = %current.id,
                            "Ignoring stale version"
                        );
                        return Ok(InsertOutcome::Stale { current: current.id });
                    }
                    Some(current) => {
                        slot.insert(record.id.clone());
                        self.records.insert(record.id.clone(), record.clone());
                        self.records.remove(&current.id);
                        debug!(
                            coordinate = %coord,
                            record = %record.id,
                            previous = %current.id,
                            "Replaced older version"
                        );
                        InsertOutcome::Superseded {
                            previous: current.id,
                        }
                    }
                    None => {
                        warn!(coordinate = %coord, "Coordinate index pointed at a missing record");
                        slot.insert(record.id.clone());
                        self.records.insert(record.id.clone(), record.clone());
                        InsertOutcome::Inserted
                    }
                }
            }
        };

        self.announce(record);
        Ok(outcome)
    }

    fn query(&self, filter: &QueryFilter) -> Vec<Record> {
        let mut matched: Vec<Record> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        // newest first, like a node would answer
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    fn timeline(&self, filter: QueryFilter) -> RecordStream {
        // Subscribe before the snapshot so nothing inserted in between is lost
        let mut additions = self.additions.subscribe();
        let initial = self.query(&filter);

        Box::pin(async_stream::stream! {
            let mut seen: HashSet<RecordId> = HashSet::new();
            for record in initial {
                seen.insert(record.id.clone());
                yield record;
            }
            loop {
                match additions.recv().await {
                    Ok(record) => {
                        if filter.matches(&record) && seen.insert(record.id.clone()) {
                            yield record;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Timeline subscriber lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{AuthorKey, Kind, Tag, UnsignedRecord};
    use futures::StreamExt;

    fn record(kind: Kind, ident: Option<&str>, ts: u64, body: &str) -> Record {
        let mut draft = UnsignedRecord::new(AuthorKey::new("pubkeyA"), kind, ts).with_content(body);
        if let Some(ident) = ident {
            draft = draft.with_tag(Tag::pair("d", ident));
        }
        let id = draft.compute_id();
        draft.into_record(id, "sig")
    }

    #[test]
    fn test_insert_and_lookup() {
        let store = InMemoryRecordStore::new();
        let highlight = record(Kind::HIGHLIGHT, None, 1, "quote");
        assert_eq!(store.insert(highlight.clone()).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(highlight.clone()).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.get(&highlight.id), Some(highlight));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replaceable_versions() {
        let store = InMemoryRecordStore::new();
        let v1 = record(Kind::LONG_FORM, Some("post"), 10, "v1");
        let v2 = record(Kind::LONG_FORM, Some("post"), 20, "v2");
        let v0 = record(Kind::LONG_FORM, Some("post"), 5, "v0");
        let coord = v1.coordinate().unwrap();

        assert_eq!(store.insert(v1.clone()).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert(v2.clone()).unwrap(),
            InsertOutcome::Superseded {
                previous: v1.id.clone()
            }
        );
        assert_eq!(
            store.insert(v0).unwrap(),
            InsertOutcome::Stale {
                current: v2.id.clone()
            }
        );
        assert_eq!(store.get_by_coordinate(&coord), Some(v2));
        assert!(store.get(&v1.id).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_addressable_without_identifier_rejected() {
        let store = InMemoryRecordStore::new();
        let bad = record(Kind::LONG_FORM, None, 1, "x");
        assert!(matches!(
            store.insert(bad),
            Err(StorageError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_query_orders_newest_first_with_limit() {
        let store = InMemoryRecordStore::new();
        for ts in [3, 1, 2] {
            store
                .insert(record(Kind::HIGHLIGHT, None, ts, &ts.to_string()))
                .unwrap();
        }
        let results = store.query(&QueryFilter::new().kind(Kind::HIGHLIGHT).limit(2));
        let stamps: Vec<u64> = results.iter().map(|r| r.created_at).collect();
        assert_eq!(stamps, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_timeline_emits_snapshot_then_additions() {
        let store = InMemoryRecordStore::new();
        let first = record(Kind::HIGHLIGHT, None, 1, "first");
        store.insert(first.clone()).unwrap();

        let mut timeline = store.timeline(QueryFilter::new().kind(Kind::HIGHLIGHT));
        assert_eq!(timeline.next().await, Some(first));

        store
            .insert(record(Kind::LONG_FORM, Some("other"), 1, "ignored"))
            .unwrap();
        let second = record(Kind::HIGHLIGHT, None, 2, "second");
        store.insert(second.clone()).unwrap();
        assert_eq!(timeline.next().await, Some(second));
    }

    #[test]
    fn test_timeline_waits_for_matching_insert() {
        let store = InMemoryRecordStore::new();
        let mut timeline =
            tokio_test::task::spawn(store.timeline(QueryFilter::new().kind(Kind::HIGHLIGHT)));
        tokio_test::assert_pending!(timeline.poll_next());

        store
            .insert(record(Kind::LONG_FORM, Some("other"), 1, "ignored"))
            .unwrap();
        tokio_test::assert_pending!(timeline.poll_next());

        let quote = record(Kind::HIGHLIGHT, None, 2, "quote");
        store.insert(quote.clone()).unwrap();
        assert!(timeline.is_woken());
        tokio_test::assert_ready_eq!(timeline.poll_next(), Some(quote));
    }
}

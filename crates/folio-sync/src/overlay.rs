//! Publish-state overlay
//!
//! Per-record publish metadata kept beside the immutable records: which
//! nodes accepted or rejected the record, whether it is local-only, and
//! whether a sync is in flight. Entries are keyed by record id only and are
//! never derived from record content.
//!
//! Different subsystems update different fields of the same entry, so every
//! write is a shallow merge over the existing entry.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use folio_core::{NodeUrl, PublishOutcome, RecordId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Publish metadata for one record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishState {
    pub accepted_by: BTreeSet<NodeUrl>,
    /// Rejecting node and its message
    pub rejected_by: BTreeMap<NodeUrl, String>,
    /// No remote node has accepted the record
    pub is_local_only: bool,
    pub is_syncing: bool,
}

impl PublishState {
    pub fn accepted_remotely(&self) -> bool {
        self.accepted_by.iter().any(|url| !url.is_local())
    }

    fn apply(&mut self, patch: PublishStatePatch) {
        if let Some(accepted_by) = patch.accepted_by {
            self.accepted_by = accepted_by;
        }
        if let Some(rejected_by) = patch.rejected_by {
            self.rejected_by = rejected_by;
        }
        if let Some(is_local_only) = patch.is_local_only {
            self.is_local_only = is_local_only;
        }
        if let Some(is_syncing) = patch.is_syncing {
            self.is_syncing = is_syncing;
        }
    }
}

/// Partial update; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStatePatch {
    pub accepted_by: Option<BTreeSet<NodeUrl>>,
    pub rejected_by: Option<BTreeMap<NodeUrl, String>>,
    pub is_local_only: Option<bool>,
    pub is_syncing: Option<bool>,
}

impl PublishStatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted_by(mut self, nodes: impl IntoIterator<Item = NodeUrl>) -> Self {
        self.accepted_by = Some(nodes.into_iter().collect());
        self
    }

    pub fn rejected_by(mut self, rejections: BTreeMap<NodeUrl, String>) -> Self {
        self.rejected_by = Some(rejections);
        self
    }

    pub fn local_only(mut self, is_local_only: bool) -> Self {
        self.is_local_only = Some(is_local_only);
        self
    }

    pub fn syncing(mut self, is_syncing: bool) -> Self {
        self.is_syncing = Some(is_syncing);
        self
    }
}

/// Overlay change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    Updated { id: RecordId, state: PublishState },
    SyncStateChanged { id: RecordId, is_syncing: bool },
}

/// Process-lifetime publish-state table
#[derive(Debug)]
pub struct PublishStateOverlay {
    entries: DashMap<RecordId, PublishState>,
    events: broadcast::Sender<OverlayEvent>,
}

impl Default for PublishStateOverlay {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PublishStateOverlay {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    /// Merge a patch into the entry for `id`, creating it if needed
    pub fn set_state(&self, id: &RecordId, patch: PublishStatePatch) -> PublishState {
        let syncing = patch.is_syncing;
        let state = {
            let mut entry = self.entries.entry(id.clone()).or_default();
            entry.apply(patch);
            entry.clone()
        };
        trace!(record = %id, ?state, "Publish state updated");
        self.notify(id, &state, syncing);
        state
    }

    /// Fold per-node publish outcomes into the entry
    ///
    /// Acceptances accumulate across attempts; a later acceptance clears an
    /// earlier rejection from the same node. `is_local_only` is recomputed
    /// from the accumulated acceptances.
    pub fn record_outcomes(&self, id: &RecordId, outcomes: &[PublishOutcome]) -> PublishState {
        let state = {
            let mut entry = self.entries.entry(id.clone()).or_default();
            for outcome in outcomes {
                if outcome.ok {
                    entry.rejected_by.remove(&outcome.from);
                    entry.accepted_by.insert(outcome.from.clone());
                } else if !entry.accepted_by.contains(&outcome.from) {
                    entry
                        .rejected_by
                        .insert(outcome.from.clone(), outcome.message.clone());
                }
            }
            entry.is_local_only = !entry.accepted_remotely();
            entry.clone()
        };
        trace!(record = %id, ?state, "Publish outcomes recorded");
        self.notify(id, &state, None);
        state
    }

    fn notify(&self, id: &RecordId, state: &PublishState, syncing: Option<bool>) {
        // no subscribers is fine
        let _ = self.events.send(OverlayEvent::Updated {
            id: id.clone(),
            state: state.clone(),
        });
        if let Some(is_syncing) = syncing {
            let _ = self.events.send(OverlayEvent::SyncStateChanged {
                id: id.clone(),
                is_syncing,
            });
        }
    }

    pub fn get_state(&self, id: &RecordId) -> Option<PublishState> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn reset(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> NodeUrl {
        NodeUrl::parse(s).unwrap()
    }

    fn id() -> RecordId {
        RecordId::new("ab".repeat(32))
    }

    #[test]
    fn test_set_state_merges() {
        let overlay = PublishStateOverlay::default();
        overlay.set_state(&id(), PublishStatePatch::new().syncing(true));
        let state = overlay.set_state(
            &id(),
            PublishStatePatch::new().accepted_by([url("wss://relay.example.com")]),
        );
        assert!(state.is_syncing);
        assert_eq!(state.accepted_by.len(), 1);
        assert_eq!(overlay.get_state(&id()), Some(state));
    }

    #[test]
    fn test_record_outcomes_recomputes_local_only() {
        let overlay = PublishStateOverlay::default();
        let local = url("ws://localhost:4869");
        let remote = url("wss://relay.example.com");

        let state = overlay.record_outcomes(
            &id(),
            &[
                PublishOutcome::accepted(local.clone()),
                PublishOutcome::rejected(remote.clone(), "not connected"),
            ],
        );
        assert!(state.is_local_only);
        assert_eq!(state.rejected_by.get(&remote).map(String::as_str), Some("not connected"));

        let state = overlay.record_outcomes(&id(), &[PublishOutcome::accepted(remote.clone())]);
        assert!(!state.is_local_only);
        assert!(state.accepted_by.contains(&local));
        assert!(state.rejected_by.is_empty());
    }

    #[test]
    fn test_total_failure_is_local_only() {
        let overlay = PublishStateOverlay::default();
        let state = overlay.record_outcomes(&id(), &[]);
        assert!(state.is_local_only);
        assert!(state.accepted_by.is_empty());
    }

    #[tokio::test]
    async fn test_sync_state_notifications() {
        let overlay = PublishStateOverlay::default();
        let mut events = overlay.subscribe();
        overlay.set_state(&id(), PublishStatePatch::new().syncing(true));

        assert!(matches!(events.recv().await.unwrap(), OverlayEvent::Updated { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            OverlayEvent::SyncStateChanged {
                id: id(),
                is_syncing: true
            }
        );
    }

    #[test]
    fn test_reset() {
        let overlay = PublishStateOverlay::default();
        overlay.set_state(&id(), PublishStatePatch::new().local_only(true));
        overlay.reset();
        assert!(overlay.get_state(&id()).is_none());
        assert!(overlay.is_empty());
    }
}

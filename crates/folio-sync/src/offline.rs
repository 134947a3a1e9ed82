//! Reconnection sync for the offline queue
//!
//! A [`ConnectivityMonitor`] folds pool status updates into a three-state
//! machine. Only the `IsolatedOnly -> Connected` transition (a remote node
//! became reachable while only local nodes were) triggers a replay of the
//! offline queue through [`ReconnectionSync`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use folio_core::{NodeTransport, Record, RecordId};
use folio_storage::{OfflineQueue, RecordStore};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::overlay::{PublishStateOverlay, PublishStatePatch};
use crate::tiering::{ConnectivityStatus, NodePool};

/// Remote reachability as seen by the monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Nothing observed yet
    #[default]
    Unknown,
    /// No remote node reachable
    IsolatedOnly,
    /// At least one remote node reachable
    Connected,
}

impl From<ConnectivityStatus> for ConnectivityState {
    fn from(status: ConnectivityStatus) -> Self {
        if status.has_remote() {
            ConnectivityState::Connected
        } else {
            ConnectivityState::IsolatedOnly
        }
    }
}

/// Connectivity state machine
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    state: ConnectivityState,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Apply an observation; true only on `IsolatedOnly -> Connected`
    pub fn observe(&mut self, status: ConnectivityStatus) -> bool {
        let next = ConnectivityState::from(status);
        let previous = std::mem::replace(&mut self.state, next);
        if previous != next {
            debug!(?previous, ?next, "Connectivity state changed");
        }
        previous == ConnectivityState::IsolatedOnly && next == ConnectivityState::Connected
    }
}

/// Result of one replay of the offline queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records a publish was attempted for
    pub attempted: usize,
    /// Accepted by a remote node and dequeued
    pub synced: Vec<RecordId>,
    /// Still queued
    pub failed: Vec<RecordId>,
    /// Queued ids with no record in the local store
    pub dropped: Vec<RecordId>,
}

/// Clears the in-flight flag when a run ends, even if it is cancelled
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays queued records to the remote tier
pub struct ReconnectionSync {
    transport: Arc<dyn NodeTransport>,
    pool: Arc<NodePool>,
    store: Arc<dyn RecordStore>,
    queue: Arc<OfflineQueue>,
    overlay: Arc<PublishStateOverlay>,
    config: ReconnectConfig,
    in_flight: AtomicBool,
}

impl ReconnectionSync {
    pub fn new(
        transport: Arc<dyn NodeTransport>,
        pool: Arc<NodePool>,
        store: Arc<dyn RecordStore>,
        queue: Arc<OfflineQueue>,
        overlay: Arc<PublishStateOverlay>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            transport,
            pool,
            store,
            queue,
            overlay,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Debounce, then replay the queue
    ///
    /// Returns `None` if a run was already in flight.
    pub async fn trigger(&self) -> Option<SyncReport> {
        self.debounced(std::future::pending()).await
    }

    /// Like [`trigger`](Self::trigger), but gives up if `cancelled`
    /// completes before the debounce elapses
    async fn debounced(&self, cancelled: impl Future<Output = ()>) -> Option<SyncReport> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Queue replay already running, dropping trigger");
            return None;
        };
        tokio::select! {
            _ = cancelled => {
                debug!("Queue replay cancelled during debounce");
                return None;
            }
            _ = tokio::time::sleep(self.config.debounce) => {}
        }
        Some(self.replay().await)
    }

    /// Replay the queue now, without the debounce
    pub async fn run_once(&self) -> Option<SyncReport> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Queue replay already running, dropping trigger");
            return None;
        };
        Some(self.replay().await)
    }

    async fn replay(&self) -> SyncReport {
        let mut report = SyncReport::default();

        let mut pending: Vec<Record> = Vec::new();
        for id in self.queue.ids() {
            match self.store.get(&id) {
                Some(record) => pending.push(record),
                None => {
                    debug!(record = %id, "Queued record no longer stored, dropping");
                    self.queue.discard(&id);
                    report.dropped.push(id);
                }
            }
        }

        for record in &pending {
            self.overlay
                .set_state(&record.id, PublishStatePatch::new().syncing(true));
        }

        let targets = self.pool.connected_snapshot().remote;
        for record in pending {
            report.attempted += 1;
            let outcomes = if targets.is_empty() {
                Vec::new()
            } else {
                self.transport.publish(&targets, &record).await
            };

            let state = self.overlay.record_outcomes(&record.id, &outcomes);
            if state.accepted_remotely() {
                self.queue.discard(&record.id);
                self.overlay.set_state(
                    &record.id,
                    PublishStatePatch::new().syncing(false).local_only(false),
                );
                report.synced.push(record.id);
            } else {
                debug!(record = %record.id, "Queued record still not accepted remotely");
                self.overlay
                    .set_state(&record.id, PublishStatePatch::new().syncing(false));
                report.failed.push(record.id);
            }
        }

        if let Err(e) = self.queue.persist() {
            warn!(error = %e, "Failed to persist offline queue after replay");
        }

        info!(
            attempted = report.attempted,
            synced = report.synced.len(),
            failed = report.failed.len(),
            dropped = report.dropped.len(),
            "Offline queue replayed"
        );
        report
    }

    /// Watch pool connectivity and replay on every reconnection
    ///
    /// The returned task finishes only after any replay it started, so the
    /// queue is settled once the handle resolves.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut status = self.pool.watch_status();
        let mut monitor = ConnectivityMonitor::new();
        monitor.observe(*status.borrow_and_update());

        tokio::spawn(async move {
            debug!(state = ?monitor.state(), "Reconnection sync started");
            let mut replays: Vec<JoinHandle<()>> = Vec::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Reconnection sync shutting down");
                        break;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *status.borrow_and_update();
                        if monitor.observe(current) {
                            info!(
                                remote = current.remote_connected,
                                queued = self.queue.len(),
                                "Remote tier reachable again"
                            );
                            let sync = Arc::clone(&self);
                            let mut cancel = shutdown_rx.resubscribe();
                            replays.retain(|replay| !replay.is_finished());
                            replays.push(tokio::spawn(async move {
                                sync.debounced(async move {
                                    let _ = cancel.recv().await;
                                })
                                .await;
                            }));
                        }
                    }
                }
            }

            for replay in replays {
                if let Err(e) = replay.await {
                    warn!(error = %e, "Queue replay ended abnormally");
                }
            }
        })
    }
}

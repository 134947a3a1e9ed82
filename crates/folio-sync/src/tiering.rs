//! Node pool and tiering
//!
//! The pool holds every configured node with its tier and live connection
//! flag. Queries and writes never read the pool directly while running; they
//! take a [`TierSnapshot`] at call start so pool mutation cannot change an
//! in-flight node list.

use std::collections::BTreeMap;
use std::sync::Arc;

use folio_core::{ConnectionEvent, NodeTier, NodeTransport, NodeUrl};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

/// A pool member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub url: NodeUrl,
    pub tier: NodeTier,
    pub connected: bool,
}

/// Node list split by tier, local first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierSnapshot {
    pub local: Vec<NodeUrl>,
    pub remote: Vec<NodeUrl>,
}

impl TierSnapshot {
    /// Classify URLs into tiers, dropping duplicates
    pub fn from_urls(urls: impl IntoIterator<Item = NodeUrl>) -> Self {
        let mut snapshot = Self::default();
        for url in urls {
            let bucket = match url.tier() {
                NodeTier::Local => &mut snapshot.local,
                NodeTier::Remote => &mut snapshot.remote,
            };
            if !bucket.contains(&url) {
                bucket.push(url);
            }
        }
        snapshot
    }

    /// Every node, local tier first
    pub fn ordered(&self) -> Vec<NodeUrl> {
        self.local.iter().chain(self.remote.iter()).cloned().collect()
    }

    pub fn tier(&self, tier: NodeTier) -> &[NodeUrl] {
        match tier {
            NodeTier::Local => &self.local,
            NodeTier::Remote => &self.remote,
        }
    }

    pub fn has_remote(&self) -> bool {
        !self.remote.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }
}

/// Nodes to connect and disconnect to reach a desired pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolDiff {
    pub added: Vec<NodeUrl>,
    pub removed: Vec<NodeUrl>,
}

impl PoolDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Connected node counts per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub local_connected: usize,
    pub remote_connected: usize,
}

impl ConnectivityStatus {
    /// At least one node of any tier is connected
    pub fn has_any(&self) -> bool {
        self.local_connected > 0 || self.remote_connected > 0
    }

    pub fn has_remote(&self) -> bool {
        self.remote_connected > 0
    }
}

/// Shared pool of nodes
#[derive(Debug)]
pub struct NodePool {
    nodes: RwLock<BTreeMap<NodeUrl, NodeInfo>>,
    status_tx: watch::Sender<ConnectivityStatus>,
}

impl Default for NodePool {
    fn default() -> Self {
        Self::new()
    }
}

impl NodePool {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectivityStatus::default());
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            status_tx,
        }
    }

    /// Create a pool with the given (disconnected) members
    pub fn with_nodes(urls: impl IntoIterator<Item = NodeUrl>) -> Self {
        let pool = Self::new();
        for url in urls {
            pool.add(url);
        }
        pool
    }

    /// Add a node; returns false if already present
    pub fn add(&self, url: NodeUrl) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&url) {
            return false;
        }
        let tier = url.tier();
        trace!(node = %url, %tier, "Adding node to pool");
        nodes.insert(
            url.clone(),
            NodeInfo {
                url,
                tier,
                connected: false,
            },
        );
        true
    }

    /// Remove a node; returns false if absent
    pub fn remove(&self, url: &NodeUrl) -> bool {
        let removed = self.nodes.write().remove(url);
        let was_connected = removed.as_ref().is_some_and(|n| n.connected);
        if was_connected {
            self.publish_status();
        }
        removed.is_some()
    }

    pub fn contains(&self, url: &NodeUrl) -> bool {
        self.nodes.read().contains_key(url)
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Every member, split by tier
    pub fn snapshot(&self) -> TierSnapshot {
        TierSnapshot::from_urls(self.nodes.read().keys().cloned())
    }

    /// Currently connected members, split by tier
    pub fn connected_snapshot(&self) -> TierSnapshot {
        TierSnapshot::from_urls(
            self.nodes
                .read()
                .values()
                .filter(|n| n.connected)
                .map(|n| n.url.clone()),
        )
    }

    /// Update a member's live flag; unknown nodes are ignored
    pub fn set_connected(&self, url: &NodeUrl, connected: bool) -> bool {
        let changed = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(url) {
                Some(node) if node.connected != connected => {
                    node.connected = connected;
                    true
                }
                Some(_) => false,
                None => {
                    trace!(node = %url, "Connection change for node outside the pool");
                    false
                }
            }
        };
        if changed {
            debug!(node = %url, connected, "Node connection changed");
            self.publish_status();
        }
        changed
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_replace(status);
    }

    pub fn status(&self) -> ConnectivityStatus {
        let nodes = self.nodes.read();
        let mut status = ConnectivityStatus::default();
        for node in nodes.values().filter(|n| n.connected) {
            match node.tier {
                NodeTier::Local => status.local_connected += 1,
                NodeTier::Remote => status.remote_connected += 1,
            }
        }
        status
    }

    /// Observe connectivity status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status_tx.subscribe()
    }

    /// Compute the changes needed to reach `desired`
    ///
    /// Local nodes already in the pool are never removed, even when they are
    /// missing from `desired`.
    pub fn diff(&self, desired: &[NodeUrl]) -> PoolDiff {
        let nodes = self.nodes.read();
        let mut added: Vec<NodeUrl> = Vec::new();
        for url in desired {
            if !nodes.contains_key(url) && !added.contains(url) {
                added.push(url.clone());
            }
        }
        let removed = nodes
            .values()
            .filter(|n| n.tier == NodeTier::Remote && !desired.contains(&n.url))
            .map(|n| n.url.clone())
            .collect();
        PoolDiff { added, removed }
    }

    /// Apply [`diff`](Self::diff): connect added nodes, disconnect removed ones
    ///
    /// Connection failures leave the node in the pool as disconnected; close
    /// failures are logged and ignored.
    #[instrument(skip(self, desired, transport), fields(desired = desired.len()))]
    pub async fn reconcile(&self, desired: &[NodeUrl], transport: &dyn NodeTransport) -> PoolDiff {
        let diff = self.diff(desired);

        for url in &diff.removed {
            self.remove(url);
            if let Err(e) = transport.disconnect(url).await {
                warn!(node = %url, error = %e, "Ignoring error while closing node connection");
            }
        }

        for url in &diff.added {
            self.add(url.clone());
            match transport.connect(url).await {
                Ok(()) => {
                    self.set_connected(url, true);
                }
                Err(e) => warn!(node = %url, error = %e, "Failed to connect to node"),
            }
        }

        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                "Reconciled node pool"
            );
        }
        diff
    }

    /// Refresh every member's live flag from the transport
    pub fn refresh(&self, transport: &dyn NodeTransport) {
        let urls: Vec<NodeUrl> = self.nodes.read().keys().cloned().collect();
        for url in urls {
            self.set_connected(&url, transport.is_connected(&url));
        }
    }

    /// Follow transport connection events until shutdown
    pub fn track(
        self: &Arc<Self>,
        transport: Arc<dyn NodeTransport>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        // Subscribe before the refresh so no event falls in between
        let mut events = transport.connection_events();
        pool.refresh(transport.as_ref());

        tokio::spawn(async move {
            debug!("Connectivity tracking started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Connectivity tracking shutting down");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(ConnectionEvent::Connected(url)) => {
                            pool.set_connected(&url, true);
                        }
                        Ok(ConnectionEvent::Disconnected(url)) => {
                            pool.set_connected(&url, false);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Missed connection events, refreshing pool");
                            pool.refresh(transport.as_ref());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::MockNodeTransport;

    fn url(s: &str) -> NodeUrl {
        NodeUrl::parse(s).unwrap()
    }

    #[test]
    fn test_snapshot_orders_local_first() {
        let snapshot = TierSnapshot::from_urls([
            url("wss://relay.example.com"),
            url("ws://localhost:4869"),
            url("wss://nos.example.org"),
            url("ws://192.168.1.5:7777"),
        ]);
        assert_eq!(snapshot.local.len(), 2);
        assert_eq!(snapshot.remote.len(), 2);
        let ordered = snapshot.ordered();
        assert!(ordered[0].is_local() && ordered[1].is_local());
        assert!(!ordered[2].is_local());
    }

    #[test]
    fn test_diff_uses_canonical_urls_and_keeps_local() {
        let pool = NodePool::with_nodes([
            url("wss://relay.example.com"),
            url("ws://localhost:4869"),
            url("wss://old.example.com"),
        ]);

        let diff = pool.diff(&[url("wss://relay.example.com/"), url("wss://new.example.com")]);
        assert_eq!(diff.added, vec![url("wss://new.example.com")]);
        assert_eq!(diff.removed, vec![url("wss://old.example.com")]);
    }

    #[test]
    fn test_status_counts_connected_by_tier() {
        let local = url("ws://localhost:4869");
        let remote = url("wss://relay.example.com");
        let pool = NodePool::with_nodes([local.clone(), remote.clone()]);
        let watcher = pool.watch_status();

        assert!(!pool.status().has_any());
        assert!(pool.set_connected(&local, true));
        assert!(!pool.set_connected(&local, true));
        assert_eq!(
            *watcher.borrow(),
            ConnectivityStatus {
                local_connected: 1,
                remote_connected: 0
            }
        );
        pool.set_connected(&remote, true);
        assert!(pool.status().has_remote());
        assert_eq!(pool.connected_snapshot().len(), 2);

        pool.remove(&remote);
        assert!(!watcher.borrow().has_remote());
    }

    #[tokio::test]
    async fn test_reconcile_swallows_close_errors() {
        let transport = MockNodeTransport::new();
        let stuck = url("wss://stuck.example.com");
        let fresh = url("wss://fresh.example.com");
        transport.add_node(&stuck);
        transport.add_node(&fresh);
        transport.set_close_fails(&stuck, true);

        let pool = NodePool::with_nodes([stuck.clone()]);
        let diff = pool.reconcile(&[fresh.clone()], &transport).await;

        assert_eq!(diff.removed, vec![stuck.clone()]);
        assert_eq!(diff.added, vec![fresh.clone()]);
        assert!(!pool.contains(&stuck));
        assert!(pool.nodes().iter().any(|n| n.url == fresh && n.connected));
    }

    #[tokio::test]
    async fn test_track_follows_connection_events() {
        let transport = Arc::new(MockNodeTransport::new());
        let remote = url("wss://relay.example.com");
        transport.add_node(&remote);

        let pool = Arc::new(NodePool::with_nodes([remote.clone()]));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = pool.track(transport.clone(), shutdown_rx);

        let mut status = pool.watch_status();
        transport.bring_online(&remote);
        status.wait_for(|s| s.has_remote()).await.unwrap();

        transport.take_offline(&remote);
        status.wait_for(|s| !s.has_any()).await.unwrap();

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

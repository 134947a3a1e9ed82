//! Mock transport implementation for testing
//!
//! Provides an in-memory pool of nodes for exercising query, publish and
//! reconnection logic without real network connections.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use folio_core::{MockNodeTransport, NodeTransport, NodeUrl, QueryFilter};
//!
//! let transport = MockNodeTransport::new();
//! let local = NodeUrl::parse("ws://localhost:4869").unwrap();
//! transport.add_node(&local);
//! transport.connect(&local).await.unwrap();
//! transport.seed(&local, record.clone());
//!
//! let stream = transport.request(&[local], &filter).await.unwrap();
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::{SignerError, TransportError};
use crate::filter::QueryFilter;
use crate::node::NodeUrl;
use crate::record::{Record, RecordId, UnsignedRecord};
use crate::traits::Signer;
use crate::transport::{ConnectionEvent, NodeTransport, PublishOutcome, RecordStream};

/// Behaviour of a single simulated node
#[derive(Debug)]
struct MockNode {
    records: Vec<Record>,
    online: bool,
    latency: Duration,
    /// Never send end-of-stream
    stall: bool,
    /// Deliver every record twice
    duplicate: bool,
    /// Reject publishes with this message
    reject: Option<String>,
    close_fails: bool,
    live: broadcast::Sender<Record>,
}

impl MockNode {
    fn new() -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            records: Vec::new(),
            online: true,
            latency: Duration::ZERO,
            stall: false,
            duplicate: false,
            reject: None,
            close_fails: false,
            live,
        }
    }

    fn matching(&self, filter: &QueryFilter) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    fn store(&mut self, record: Record) {
        if !self.records.iter().any(|r| r.id == record.id) {
            self.records.push(record.clone());
            let _ = self.live.send(record);
        }
    }
}

/// An in-memory node pool for tests
pub struct MockNodeTransport {
    nodes: DashMap<NodeUrl, MockNode>,
    connected: DashSet<NodeUrl>,
    events: broadcast::Sender<ConnectionEvent>,
    request_count: AtomicUsize,
    publish_log: Mutex<Vec<(NodeUrl, RecordId)>>,
}

impl Default for MockNodeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNodeTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            nodes: DashMap::new(),
            connected: DashSet::new(),
            events,
            request_count: AtomicUsize::new(0),
            publish_log: Mutex::new(Vec::new()),
        }
    }

    /// Register an online (but not yet connected) node
    pub fn add_node(&self, url: &NodeUrl) {
        self.nodes.entry(url.clone()).or_insert_with(MockNode::new);
    }

    /// Store a record at a node
    pub fn seed(&self, url: &NodeUrl, record: Record) {
        self.nodes
            .entry(url.clone())
            .or_insert_with(MockNode::new)
            .store(record);
    }

    /// Delay before the node answers a request or acknowledges a publish
    pub fn set_latency(&self, url: &NodeUrl, latency: Duration) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.latency = latency;
        }
    }

    pub fn set_stall(&self, url: &NodeUrl, stall: bool) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.stall = stall;
        }
    }

    pub fn set_duplicate(&self, url: &NodeUrl, duplicate: bool) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.duplicate = duplicate;
        }
    }

    pub fn set_reject(&self, url: &NodeUrl, reason: Option<&str>) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.reject = reason.map(str::to_string);
        }
    }

    pub fn set_close_fails(&self, url: &NodeUrl, fails: bool) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.close_fails = fails;
        }
    }

    /// Make a node reachable and connected, notifying listeners
    pub fn bring_online(&self, url: &NodeUrl) {
        self.nodes
            .entry(url.clone())
            .or_insert_with(MockNode::new)
            .online = true;
        if self.connected.insert(url.clone()) {
            let _ = self.events.send(ConnectionEvent::Connected(url.clone()));
        }
    }

    /// Drop a node off the network, notifying listeners
    pub fn take_offline(&self, url: &NodeUrl) {
        if let Some(mut node) = self.nodes.get_mut(url) {
            node.online = false;
        }
        if self.connected.remove(url).is_some() {
            let _ = self.events.send(ConnectionEvent::Disconnected(url.clone()));
        }
    }

    /// Number of `request` calls made so far
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Ids accepted by a node through `publish`
    pub fn published_to(&self, url: &NodeUrl) -> Vec<RecordId> {
        self.publish_log
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn records_at(&self, url: &NodeUrl) -> Vec<Record> {
        self.nodes
            .get(url)
            .map(|n| n.records.clone())
            .unwrap_or_default()
    }

    fn reachable(&self, url: &NodeUrl) -> bool {
        self.connected.contains(url) && self.nodes.get(url).is_some_and(|n| n.online)
    }

    fn open_stream(
        &self,
        nodes: &[NodeUrl],
        filter: &QueryFilter,
        live: bool,
    ) -> Result<RecordStream, TransportError> {
        let reachable: Vec<&NodeUrl> = nodes.iter().filter(|u| self.reachable(u)).collect();
        if reachable.is_empty() {
            return Err(TransportError::NoReachableNodes);
        }

        let (tx, mut rx) = mpsc::channel::<Record>(256);
        for url in reachable {
            let Some(node) = self.nodes.get(url) else {
                continue;
            };
            let records = node.matching(filter);
            let latency = node.latency;
            let stall = node.stall;
            let duplicate = node.duplicate;
            let mut live_rx = node.live.subscribe();
            let filter = filter.clone();
            let tx = tx.clone();
            let url = url.clone();

            tokio::spawn(async move {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                for record in records {
                    let copies = if duplicate { 2 } else { 1 };
                    for _ in 0..copies {
                        if tx.send(record.clone()).await.is_err() {
                            return;
                        }
                    }
                }
                trace!(node = %url, "mock node reached end of stored records");
                if live {
                    while let Ok(record) = live_rx.recv().await {
                        if filter.matches(&record) && tx.send(record).await.is_err() {
                            return;
                        }
                    }
                } else if stall {
                    std::future::pending::<()>().await;
                }
            });
        }
        drop(tx);

        Ok(Box::pin(async_stream::stream! {
            while let Some(record) = rx.recv().await {
                yield record;
            }
        }))
    }
}

#[async_trait]
impl NodeTransport for MockNodeTransport {
    async fn request(
        &self,
        nodes: &[NodeUrl],
        filter: &QueryFilter,
    ) -> Result<RecordStream, TransportError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.open_stream(nodes, filter, false)
    }

    async fn subscribe(
        &self,
        nodes: &[NodeUrl],
        filter: &QueryFilter,
    ) -> Result<RecordStream, TransportError> {
        self.open_stream(nodes, filter, true)
    }

    async fn publish(&self, nodes: &[NodeUrl], record: &Record) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(nodes.len());
        for url in nodes {
            if !self.reachable(url) {
                outcomes.push(PublishOutcome::rejected(url.clone(), "not connected"));
                continue;
            }
            let latency = match self.nodes.get(url) {
                Some(node) => node.latency,
                None => continue,
            };
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let Some(mut node) = self.nodes.get_mut(url) else {
                continue;
            };
            if let Some(reason) = node.reject.clone() {
                outcomes.push(PublishOutcome::rejected(url.clone(), reason));
                continue;
            }
            node.store(record.clone());
            drop(node);
            self.publish_log.lock().push((url.clone(), record.id.clone()));
            outcomes.push(PublishOutcome::accepted(url.clone()));
        }
        outcomes
    }

    async fn connect(&self, node: &NodeUrl) -> Result<(), TransportError> {
        let online = self.nodes.get(node).is_some_and(|n| n.online);
        if !online {
            return Err(TransportError::connection_failed(node.as_str(), "unreachable"));
        }
        if self.connected.insert(node.clone()) {
            let _ = self.events.send(ConnectionEvent::Connected(node.clone()));
        }
        Ok(())
    }

    async fn disconnect(&self, node: &NodeUrl) -> Result<(), TransportError> {
        let was_connected = self.connected.remove(node).is_some();
        if was_connected {
            let _ = self.events.send(ConnectionEvent::Disconnected(node.clone()));
        }
        if self.nodes.get(node).is_some_and(|n| n.close_fails) {
            return Err(TransportError::CloseFailed {
                node: node.to_string(),
                message: "handshake in progress".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self, node: &NodeUrl) -> bool {
        self.reachable(node)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// Signer that derives ids locally and never touches real keys
#[derive(Debug, Clone, Default)]
pub struct MockSigner {
    fail: bool,
}

impl MockSigner {
    pub fn new() -> Self {
        Self { fail: false }
    }

    /// A signer whose every call fails
    pub fn unavailable() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn sign(&self, draft: UnsignedRecord) -> Result<Record, SignerError> {
        if self.fail {
            return Err(SignerError::Unavailable);
        }
        let id = draft.compute_id();
        let sig = format!("mock-sig-{}", id.short());
        Ok(draft.into_record(id, sig))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AuthorKey, Kind, Tag};
    use futures::StreamExt;

    fn url(s: &str) -> NodeUrl {
        NodeUrl::parse(s).unwrap()
    }

    async fn article(ident: &str, ts: u64) -> Record {
        MockSigner::new()
            .sign(
                UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::LONG_FORM, ts)
                    .with_tag(Tag::pair("d", ident)),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_returns_matching_records() {
        let transport = MockNodeTransport::new();
        let node = url("ws://localhost:4869");
        transport.add_node(&node);
        transport.connect(&node).await.unwrap();
        transport.seed(&node, article("a", 1).await);
        transport.seed(&node, article("b", 1).await);

        let filter = QueryFilter::new().kind(Kind::LONG_FORM).tag('d', "a");
        let stream = transport.request(&[node], &filter).await.unwrap();
        let records: Vec<_> = stream.collect().await;
        assert_eq!(records.len(), 1);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_request_fails_without_reachable_nodes() {
        let transport = MockNodeTransport::new();
        let node = url("wss://relay.example.com");
        transport.add_node(&node);
        let filter = QueryFilter::new().kind(Kind::LONG_FORM);
        assert!(matches!(
            transport.request(&[node], &filter).await,
            Err(TransportError::NoReachableNodes)
        ));
    }

    #[tokio::test]
    async fn test_publish_outcomes() {
        let transport = MockNodeTransport::new();
        let ok = url("ws://localhost:4869");
        let rejecting = url("wss://strict.example.com");
        let offline = url("wss://offline.example.com");
        for n in [&ok, &rejecting, &offline] {
            transport.add_node(n);
        }
        transport.connect(&ok).await.unwrap();
        transport.connect(&rejecting).await.unwrap();
        transport.set_reject(&rejecting, Some("blocked: not a member"));

        let record = article("a", 1).await;
        let outcomes = transport
            .publish(&[ok.clone(), rejecting.clone(), offline.clone()], &record)
            .await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert!(outcomes[1].message.contains("not a member"));
        assert!(!outcomes[2].ok);
        assert_eq!(transport.published_to(&ok), vec![record.id.clone()]);
        assert!(transport.published_to(&rejecting).is_empty());
    }

    #[tokio::test]
    async fn test_connection_events() {
        let transport = MockNodeTransport::new();
        let node = url("wss://relay.example.com");
        let mut events = transport.connection_events();

        transport.bring_online(&node);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected(node.clone()));
        transport.take_offline(&node);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected(node.clone()));
        assert!(!transport.is_connected(&node));
    }

    #[tokio::test]
    async fn test_unavailable_signer() {
        let draft = UnsignedRecord::new(AuthorKey::new("a"), Kind::HIGHLIGHT, 1);
        assert_eq!(
            MockSigner::unavailable().sign(draft).await,
            Err(SignerError::Unavailable)
        );
    }
}

//! Node pool transport abstraction
//!
//! The [`NodeTransport`] trait is the only way the sync engine talks to
//! network nodes. It allows the query, publish and reconnection logic to run
//! against real websocket connections or the in-memory
//! [`MockNodeTransport`](crate::mock_transport::MockNodeTransport).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::filter::QueryFilter;
use crate::node::NodeUrl;
use crate::record::Record;

/// Stream of records from one or more nodes
///
/// For one-shot requests the stream ends when every addressed node has sent
/// its end-of-stream signal (or dropped its connection).
pub type RecordStream = Pin<Box<dyn Stream<Item = Record> + Send>>;

/// Per-node result of a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    /// The node that answered
    pub from: NodeUrl,
    /// Whether the node durably accepted the record
    pub ok: bool,
    /// Human-readable message from the node (rejection reason)
    pub message: String,
}

impl PublishOutcome {
    pub fn accepted(from: NodeUrl) -> Self {
        Self {
            from,
            ok: true,
            message: String::new(),
        }
    }

    pub fn rejected(from: NodeUrl, message: impl Into<String>) -> Self {
        Self {
            from,
            ok: false,
            message: message.into(),
        }
    }

    /// Convert a rejection into an error value
    pub fn into_error(self) -> Option<TransportError> {
        if self.ok {
            None
        } else {
            Some(TransportError::PublishRejected {
                node: self.from.to_string(),
                message: self.message,
            })
        }
    }
}

/// Connection lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(NodeUrl),
    Disconnected(NodeUrl),
}

impl ConnectionEvent {
    pub fn url(&self) -> &NodeUrl {
        match self {
            ConnectionEvent::Connected(url) | ConnectionEvent::Disconnected(url) => url,
        }
    }
}

/// Transport to a pool of nodes
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// One-shot query; the stream completes on end-of-stream from all nodes
    ///
    /// # Errors
    ///
    /// Returns an error if none of the nodes could be reached. Nodes that
    /// fail after the request started simply end their part of the stream.
    async fn request(
        &self,
        nodes: &[NodeUrl],
        filter: &QueryFilter,
    ) -> Result<RecordStream, TransportError>;

    /// Long-lived subscription; the stream only ends when the nodes go away
    async fn subscribe(
        &self,
        nodes: &[NodeUrl],
        filter: &QueryFilter,
    ) -> Result<RecordStream, TransportError>;

    /// Publish a record, reporting the outcome per addressed node
    async fn publish(&self, nodes: &[NodeUrl], record: &Record) -> Vec<PublishOutcome>;

    /// Open a connection to a node
    async fn connect(&self, node: &NodeUrl) -> Result<(), TransportError>;

    /// Close a connection to a node
    async fn disconnect(&self, node: &NodeUrl) -> Result<(), TransportError>;

    /// Whether a node is currently connected
    fn is_connected(&self, node: &NodeUrl) -> bool;

    /// Subscribe to connection lifecycle notifications
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_outcome_into_error() {
        let url = NodeUrl::parse("wss://relay.example.com").unwrap();
        assert!(PublishOutcome::accepted(url.clone()).into_error().is_none());

        let err = PublishOutcome::rejected(url, "blocked").into_error().unwrap();
        assert!(matches!(err, TransportError::PublishRejected { .. }));
        assert!(err.to_string().contains("blocked"));
    }

    #[test]
    fn test_transport_trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn NodeTransport) {}
    }
}

//! Error types for the Folio sync engine

use thiserror::Error;

/// Top-level error type for Folio core operations
#[derive(Debug, Error)]
pub enum FolioError {
    #[error("Reference error: {0}")]
    Reference(#[from] ReferenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),
}

/// Malformed logical coordinates, filters, or node URLs
///
/// These are caller errors and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Invalid record id: {0}")]
    InvalidRecordId(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid node URL: {0}")]
    InvalidNodeUrl(String),
}

/// Errors related to node transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed ({node}): {message}")]
    ConnectionFailed { node: String, message: String },

    #[error("No reachable nodes in tier")]
    NoReachableNodes,

    #[error("Node not connected: {0}")]
    NotConnected(String),

    #[error("Publish rejected by {node}: {message}")]
    PublishRejected { node: String, message: String },

    #[error("Close failed ({node}): {message}")]
    CloseFailed { node: String, message: String },
}

impl TransportError {
    /// Create a connection failure for a node
    pub fn connection_failed(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether a later attempt against the same node may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::NoReachableNodes => true,
            Self::NotConnected(_) => true,
            Self::PublishRejected { .. } => false,
            Self::CloseFailed { .. } => false,
        }
    }
}

/// Errors surfaced by the opaque signer capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("Signer unavailable")]
    Unavailable,

    #[error("Signing rejected: {0}")]
    Rejected(String),
}

/// Terminal errors of a content resolution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Resolution completed and nothing was found in any source
    #[error("Content not found")]
    NotFound,

    /// Resolution completed with no result and at least one tier failed
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The requested reference could not be parsed
    #[error("Invalid reference: {0}")]
    InvalidReference(String),
}

impl From<ReferenceError> for ResolveError {
    fn from(err: ReferenceError) -> Self {
        ResolveError::InvalidReference(err.to_string())
    }
}

/// Result type alias for Folio core operations
pub type FolioResult<T> = Result<T, FolioError>;

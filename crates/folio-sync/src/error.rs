//! Sync-engine error types

use folio_core::{FolioError, ReferenceError, SignerError, TransportError};
use folio_storage::StorageError;
use thiserror::Error;

/// Errors that can occur in the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Core-level errors
    #[error("Core error: {0}")]
    Core(#[from] FolioError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Signing failed
    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    /// Malformed coordinate, filter or node URL
    #[error("Invalid reference: {0}")]
    InvalidReference(#[from] ReferenceError),

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The engine has not been initialized
    #[error("Engine not initialized")]
    NotInitialized,

    /// The engine is shutting down
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_conversions() {
        let err: SyncError = SignerError::Unavailable.into();
        assert!(matches!(err, SyncError::Signer(_)));

        let err: SyncError = ReferenceError::InvalidCoordinate("x".into()).into();
        assert!(matches!(err, SyncError::InvalidReference(_)));

        let err: SyncError = StorageError::CapacityExceeded.into();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_config_error_from_json() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: SyncError = json_err.into();
        assert!(matches!(err, SyncError::Config(_)));
    }
}

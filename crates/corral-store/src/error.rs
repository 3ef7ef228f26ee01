//! Error types for the Corral state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during state store operations.
///
/// Backend failures (connectivity, timeouts) surface as-is to the
/// caller; the store never retries on its own.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to store: {0}")]
    Connect(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),
}

//! Error types for the runtime driver.

use thiserror::Error;

/// Result type alias for runtime driver operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur when driving the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("failed to pull image {0}: {1}")]
    ImagePull(String, String),

    #[error("runtime backend error: {0}")]
    Backend(String),
}

//! Error types for the status fan-out.

use thiserror::Error;

/// Result type alias for fan-out operations.
pub type StatusResult<T> = Result<T, StatusError>;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Store(#[from] corral_store::StoreError),
}

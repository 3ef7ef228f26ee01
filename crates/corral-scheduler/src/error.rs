//! Error types for the scheduler.

use thiserror::Error;

use corral_store::StoreError;

/// Result type alias for scheduling operations.
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Errors that can occur during a scheduling pass.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),
}

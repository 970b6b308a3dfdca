//! Error types for the execution pipeline.

use genbatch_core::credentials::CredentialError;
use genbatch_core::error::CoreError;
use genbatch_core::types::{DbId, LeaseId};

/// Errors from a [`JobQueue`](crate::queue::JobQueue) implementation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The lease expired and the item was reclaimed (and possibly leased
    /// again). The caller must discard its result.
    #[error("Lease {0} no longer owns its item")]
    LeaseLost(LeaseId),

    #[error("Queue storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Errors from a [`BatchStore`](crate::store::BatchStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Batch {0} not found")]
    NotFound(DbId),

    #[error("Batch storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Errors from a [`ResultStore`](crate::results::ResultStore).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Result blob I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Result metadata error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Errors surfaced to callers of the
/// [`BatchCoordinator`](crate::coordinator::BatchCoordinator).
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Invalid batch: {0}")]
    Validation(String),

    #[error("Batch credential is unusable: {0}")]
    Credential(#[from] CredentialError),

    #[error("Batch {0} not found")]
    NotFound(DbId),

    #[error("Timed out waiting for batch {0}")]
    Timeout(DbId),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Results(#[from] StorageError),
}

impl From<StoreError> for BatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<CoreError> for BatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::NotFound { id, .. } => Self::NotFound(id),
            other => Self::Store(StoreError::Storage(other.to_string())),
        }
    }
}

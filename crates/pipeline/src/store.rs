//! Persistence contract for batch records and their counters.

use async_trait::async_trait;
use genbatch_core::batch::{BatchExecution, NewBatch, TerminalItem};
use genbatch_core::credentials::SealedCredential;
use genbatch_core::types::DbId;

use crate::error::StoreError;

/// Storage for [`BatchExecution`] records.
///
/// Counter updates must be atomic per call: concurrent `record_outcome`
/// calls for the same batch never lose an increment, each item is counted
/// at most once, and the status flips to terminal exactly once.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create_batch(&self, input: NewBatch) -> Result<BatchExecution, StoreError>;

    async fn find(&self, id: DbId) -> Result<Option<BatchExecution>, StoreError>;

    /// Count one terminal item, draining the batch when nothing is pending.
    /// Draining also discards the stored credential.
    ///
    /// Returns `None` if the item was already counted or the batch is
    /// missing or already drained.
    async fn record_outcome(&self, item: &TerminalItem) -> Result<Option<BatchExecution>, StoreError>;

    /// Fail every pending item of a batch whose items were never enqueued,
    /// draining it. Returns `None` if the batch is missing or drained.
    async fn abandon(&self, id: DbId, reason: &str) -> Result<Option<BatchExecution>, StoreError>;

    /// `queued -> running`. Returns `true` if the status changed.
    async fn mark_running(&self, id: DbId) -> Result<bool, StoreError>;

    /// Flag a non-terminal batch as cancelled. Returns `None` if the batch
    /// is missing or already terminal.
    async fn request_cancel(&self, id: DbId) -> Result<Option<BatchExecution>, StoreError>;

    /// Record the reason the whole batch is failing. The first reason wins.
    async fn abort(&self, id: DbId, reason: &str) -> Result<bool, StoreError>;

    /// The sealed API key, or `None` once discarded.
    async fn credential(&self, id: DbId) -> Result<Option<SealedCredential>, StoreError>;
}

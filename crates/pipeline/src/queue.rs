//! Durable work queue contract with per-item leases.
//!
//! A worker leases one item at a time. The lease is identified by a fresh
//! [`LeaseId`] and expires after the requested duration; only the current
//! holder can `ack` or `nack` it. Expired leases are reclaimed by a
//! background task so a crashed worker never strands an item.
//!
//! Delivery is at-least-once. Consumers dedupe on
//! [`BatchItem::delivery_key`], result storage is idempotent per delivery,
//! and a holder checks [`JobQueue::is_held`] before persisting output.

use std::time::Duration;

use async_trait::async_trait;
use genbatch_core::batch::{BatchItem, NewBatchItem, TerminalItem};
use genbatch_core::types::{DbId, LeaseId, Timestamp};

use crate::error::QueueError;

/// A claimed item plus the lease that owns it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    /// The item as it was when leased, `attempt_count` already incremented.
    pub item: BatchItem,
    pub worker_id: String,
    pub expires_at: Timestamp,
}

/// How a lease ends when the item did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nack {
    /// Make the item leasable again after `delay`. Becomes a terminal
    /// failure if the item has no attempts left, and a skip or failure if
    /// its batch was halted in the meantime.
    Requeue { delay: Duration, error: String },
    Fail { error: String },
    Skip { reason: String },
}

/// A batch-wide stop. No new leases are issued for a halted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    /// User cancellation: queued items are skipped.
    Cancelled,
    /// The batch cannot proceed (e.g. its credential does not open): queued
    /// items fail with the given reason.
    Aborted(String),
}

/// Result of one reclamation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Items returned to the queue.
    pub requeued: usize,
    /// Items that became terminal during the sweep.
    pub terminal: Vec<TerminalItem>,
}

/// Queue of batch items shared by all workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add items, leasable immediately. Returns the new item IDs in input
    /// order.
    async fn enqueue(&self, items: Vec<NewBatchItem>) -> Result<Vec<DbId>, QueueError>;

    /// Claim the oldest available item, or `None` if nothing is ready.
    /// Never blocks waiting for work.
    async fn lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, QueueError>;

    /// Park until work may be available or `max_wait` elapses.
    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }

    /// Whether `lease_id` is still the live, unexpired lease of its item.
    async fn is_held(&self, lease_id: LeaseId) -> Result<bool, QueueError>;

    /// The leased item succeeded and its output is stored as `result_ref`.
    async fn ack(&self, lease_id: LeaseId, result_ref: DbId) -> Result<TerminalItem, QueueError>;

    /// End the lease without success. Returns the terminal transition if the
    /// item became terminal.
    async fn nack(&self, lease_id: LeaseId, nack: Nack) -> Result<Option<TerminalItem>, QueueError>;

    /// Release expired leases.
    async fn reclaim_expired_leases(&self) -> Result<ReclaimReport, QueueError>;

    /// Stop leasing a batch and make its queued items terminal. Items that
    /// are currently leased are left to their holders.
    async fn halt_batch(&self, batch_id: DbId, halt: Halt) -> Result<Vec<TerminalItem>, QueueError>;

    /// Every item of a batch in submission order.
    async fn items(&self, batch_id: DbId) -> Result<Vec<BatchItem>, QueueError>;
}

//! Per-batch progress counters and live progress events.
//!
//! [`ProgressTracker`] is the only writer of batch counters. Each terminal
//! item transition is reported exactly once by whoever caused it (the
//! worker that acked, the coordinator that halted, the reclaimer), and the
//! underlying [`BatchStore`] applies the increment and the drain rule
//! atomically.

use std::sync::Arc;

use genbatch_core::batch::{ProgressSnapshot, TerminalItem};
use genbatch_core::types::DbId;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::store::BatchStore;

/// Default buffer capacity for the progress channel.
const DEFAULT_CAPACITY: usize = 1024;

/// A change observed on a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "snapshot", rename_all = "snake_case")]
pub enum BatchEvent {
    /// Counters moved; the batch is still running.
    Progress(ProgressSnapshot),
    /// The batch reached a terminal status. Published once per batch.
    Terminal(ProgressSnapshot),
}

impl BatchEvent {
    pub fn snapshot(&self) -> &ProgressSnapshot {
        match self {
            Self::Progress(s) | Self::Terminal(s) => s,
        }
    }
}

/// Applies terminal item outcomes to batch counters and fans out
/// [`BatchEvent`]s to subscribers.
pub struct ProgressTracker {
    store: Arc<dyn BatchStore>,
    sender: broadcast::Sender<BatchEvent>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self::with_capacity(store, DEFAULT_CAPACITY)
    }

    /// Slow subscribers observe `RecvError::Lagged` once `capacity` events
    /// are buffered.
    pub fn with_capacity(store: Arc<dyn BatchStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { store, sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }

    /// Count one terminal item. Returns the updated snapshot, or `None` if
    /// the item was already counted or the batch had already drained (the
    /// outcome is then ignored).
    pub async fn on_item_terminal(
        &self,
        item: &TerminalItem,
    ) -> Result<Option<ProgressSnapshot>, StoreError> {
        let Some(batch) = self.store.record_outcome(item).await? else {
            tracing::debug!(
                batch_id = item.batch_id,
                item_id = item.item_id,
                outcome = ?item.outcome,
                "Outcome already counted or batch drained",
            );
            return Ok(None);
        };
        Ok(Some(self.publish(batch.snapshot())))
    }

    /// Drain a batch whose items never reached the queue.
    pub async fn on_batch_abandoned(
        &self,
        batch_id: DbId,
        reason: &str,
    ) -> Result<Option<ProgressSnapshot>, StoreError> {
        let Some(batch) = self.store.abandon(batch_id, reason).await? else {
            tracing::warn!(batch_id, "Abandon for drained or unknown batch ignored");
            return Ok(None);
        };
        Ok(Some(self.publish(batch.snapshot())))
    }

    fn publish(&self, snapshot: ProgressSnapshot) -> ProgressSnapshot {
        if snapshot.is_terminal() {
            tracing::info!(
                batch_id = snapshot.batch_id,
                status = %snapshot.status,
                succeeded = snapshot.succeeded,
                failed = snapshot.failed,
                skipped = snapshot.skipped,
                "Batch finished",
            );
            let _ = self.sender.send(BatchEvent::Terminal(snapshot));
        } else {
            let _ = self.sender.send(BatchEvent::Progress(snapshot));
        }
        snapshot
    }

    /// Report a set of transitions, logging (not propagating) failures so
    /// one bad write does not hide the others.
    pub async fn report_all(&self, transitions: &[TerminalItem]) {
        for t in transitions {
            if let Err(e) = self.on_item_terminal(t).await {
                tracing::error!(
                    batch_id = t.batch_id,
                    item_id = t.item_id,
                    error = %e,
                    "Failed to record item outcome",
                );
            }
        }
    }

    /// The first lease of a batch moves it from queued to running.
    pub async fn on_item_leased(&self, batch_id: DbId) -> Result<bool, StoreError> {
        let moved = self.store.mark_running(batch_id).await?;
        if moved {
            tracing::info!(batch_id, "Batch running");
        }
        Ok(moved)
    }

    pub async fn snapshot(&self, batch_id: DbId) -> Result<ProgressSnapshot, StoreError> {
        self.store
            .find(batch_id)
            .await?
            .map(|batch| batch.snapshot())
            .ok_or(StoreError::NotFound(batch_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genbatch_core::batch::{ItemOutcome, NewBatch};
    use genbatch_core::credentials::SealedCredential;
    use genbatch_core::status::BatchStatus;

    use crate::memory::MemoryBatchStore;

    async fn tracker_with_batch(total: i32) -> (ProgressTracker, DbId) {
        let store = Arc::new(MemoryBatchStore::new());
        let batch = store
            .create_batch(NewBatch {
                owner_id: 1,
                total_items: total,
                credential: SealedCredential {
                    ciphertext: vec![1],
                    nonce: vec![0; 12],
                },
            })
            .await
            .unwrap();
        (ProgressTracker::new(store), batch.id)
    }

    fn done(batch_id: DbId, item_id: DbId, outcome: ItemOutcome) -> TerminalItem {
        TerminalItem {
            item_id,
            batch_id,
            outcome,
            attempt_count: 1,
        }
    }

    #[tokio::test]
    async fn publishes_progress_then_terminal() {
        let (tracker, batch_id) = tracker_with_batch(2).await;
        let mut rx = tracker.subscribe();

        tracker
            .on_item_terminal(&done(batch_id, 1, ItemOutcome::Succeeded))
            .await
            .unwrap();
        tracker
            .on_item_terminal(&done(batch_id, 2, ItemOutcome::Failed))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, BatchEvent::Progress(s) if s.succeeded == 1 && s.pending == 1));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, BatchEvent::Terminal(s) if s.status == BatchStatus::Completed));
    }

    #[tokio::test]
    async fn outcomes_after_drain_are_ignored() {
        let (tracker, batch_id) = tracker_with_batch(1).await;
        assert!(tracker
            .on_item_terminal(&done(batch_id, 1, ItemOutcome::Succeeded))
            .await
            .unwrap()
            .is_some());
        assert!(tracker
            .on_item_terminal(&done(batch_id, 2, ItemOutcome::Failed))
            .await
            .unwrap()
            .is_none());

        let snap = tracker.snapshot(batch_id).await.unwrap();
        assert_eq!((snap.succeeded, snap.failed, snap.pending), (1, 0, 0));
        assert!(snap.is_consistent());
    }

    #[tokio::test]
    async fn repeated_report_of_an_item_counts_once() {
        let (tracker, batch_id) = tracker_with_batch(2).await;
        let item = done(batch_id, 7, ItemOutcome::Failed);
        assert!(tracker.on_item_terminal(&item).await.unwrap().is_some());
        assert!(tracker.on_item_terminal(&item).await.unwrap().is_none());

        let snap = tracker.snapshot(batch_id).await.unwrap();
        assert_eq!((snap.failed, snap.pending), (1, 1));
        assert_eq!(snap.status, BatchStatus::Queued);
    }

    #[tokio::test]
    async fn concurrent_outcomes_are_all_counted() {
        let (tracker, batch_id) = tracker_with_batch(50).await;
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                let outcome = if i % 5 == 0 {
                    ItemOutcome::Failed
                } else {
                    ItemOutcome::Succeeded
                };
                let item = done(batch_id, i + 1, outcome);
                tokio::spawn(async move { tracker.on_item_terminal(&item).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snap = tracker.snapshot(batch_id).await.unwrap();
        assert_eq!((snap.succeeded, snap.failed, snap.pending), (40, 10, 0));
        assert_eq!(snap.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn abandoned_batch_publishes_terminal_failure() {
        let (tracker, batch_id) = tracker_with_batch(3).await;
        let mut rx = tracker.subscribe();

        let snap = tracker
            .on_batch_abandoned(batch_id, "storage: enqueue failed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!((snap.failed, snap.pending), (3, 0));
        assert_eq!(snap.status, BatchStatus::Failed);
        assert!(matches!(rx.recv().await.unwrap(), BatchEvent::Terminal(_)));

        assert!(tracker
            .on_batch_abandoned(batch_id, "storage: again")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unknown_batch_snapshot_is_not_found() {
        let (tracker, _) = tracker_with_batch(1).await;
        assert!(matches!(
            tracker.snapshot(999).await,
            Err(StoreError::NotFound(999))
        ));
    }
}

//! In-process implementations of [`JobQueue`] and [`BatchStore`].
//!
//! Each keeps its whole state behind one `tokio::sync::Mutex`, so every
//! operation is atomic with respect to every other. Used by tests and by
//! embedding callers that do not need durability.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use genbatch_core::batch::{
    describe_error, error_kind, BatchExecution, BatchItem, ItemOutcome, NewBatch, NewBatchItem,
    TerminalItem,
};
use genbatch_core::credentials::SealedCredential;
use genbatch_core::status::{BatchStatus, ItemStatus};
use genbatch_core::types::{DbId, LeaseId, Timestamp};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{QueueError, StoreError};
use crate::queue::{Halt, JobQueue, Lease, Nack, ReclaimReport};
use crate::store::BatchStore;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    items: BTreeMap<DbId, BatchItem>,
    /// Items that are not terminal yet. Terminal items are never scanned
    /// again.
    open: BTreeSet<DbId>,
    /// Live leases and the item each one holds.
    leases: HashMap<LeaseId, DbId>,
    /// Halted batches that still have open items.
    halted: HashMap<DbId, Halt>,
    next_id: DbId,
}

impl QueueState {
    fn find_leased(&mut self, lease_id: LeaseId) -> Result<&mut BatchItem, QueueError> {
        let id = self
            .leases
            .get(&lease_id)
            .copied()
            .ok_or(QueueError::LeaseLost(lease_id))?;
        self.items
            .get_mut(&id)
            .filter(|item| item.status == ItemStatus::Leased && item.lease_id == Some(lease_id))
            .ok_or(QueueError::LeaseLost(lease_id))
    }

    fn open_items(&self) -> impl Iterator<Item = &BatchItem> + '_ {
        self.open.iter().filter_map(|id| self.items.get(id))
    }

    /// Whether `item` may be leased once its backoff has elapsed.
    fn is_leasable(&self, item: &BatchItem) -> bool {
        item.status == ItemStatus::Queued
            && !item.attempts_exhausted()
            && !self.halted.contains_key(&item.batch_id)
    }

    /// The leasable item that became available first.
    fn next_ready(&self, now: Timestamp) -> Option<DbId> {
        self.open_items()
            .filter(|item| self.is_leasable(item) && item.available_at <= now)
            .min_by_key(|item| (item.available_at, item.id))
            .map(|item| item.id)
    }

    /// When the next leasable item becomes available, if any.
    fn earliest_available(&self) -> Option<Timestamp> {
        self.open_items()
            .filter(|item| self.is_leasable(item))
            .map(|item| item.available_at)
            .min()
    }

    /// Status a non-successful lease ends in when the caller asked for a
    /// requeue.
    fn requeue_target(&self, item: &BatchItem) -> (ItemStatus, Option<String>) {
        match self.halted.get(&item.batch_id) {
            Some(Halt::Cancelled) => (
                ItemStatus::Skipped,
                Some(describe_error(error_kind::CANCELLED, "batch cancelled")),
            ),
            Some(Halt::Aborted(reason)) => (ItemStatus::Failed, Some(reason.clone())),
            None if item.attempts_exhausted() => (ItemStatus::Failed, None),
            None => (ItemStatus::Queued, None),
        }
    }

    /// Release the item's lease after its status was set, and stop tracking
    /// it once terminal.
    fn settle(&mut self, id: DbId) -> Option<TerminalItem> {
        let item = self.items.get_mut(&id)?;
        if let Some(lease_id) = item.lease_id.take() {
            self.leases.remove(&lease_id);
        }
        item.leased_by = None;
        item.lease_expires_at = None;

        let transition = terminal(item)?;
        self.open.remove(&id);
        self.forget_idle_halt(transition.batch_id);
        Some(transition)
    }

    /// Drop the halt of a batch with nothing left open.
    fn forget_idle_halt(&mut self, batch_id: DbId) {
        if self.halted.contains_key(&batch_id)
            && !self.open_items().any(|item| item.batch_id == batch_id)
        {
            self.halted.remove(&batch_id);
        }
    }
}

fn terminal(item: &BatchItem) -> Option<TerminalItem> {
    let outcome = match item.status {
        ItemStatus::Succeeded => ItemOutcome::Succeeded,
        ItemStatus::Failed => ItemOutcome::Failed,
        ItemStatus::Skipped => ItemOutcome::Skipped,
        ItemStatus::Queued | ItemStatus::Leased => return None,
    };
    Some(TerminalItem {
        item_id: item.id,
        batch_id: item.batch_id,
        outcome,
        attempt_count: item.attempt_count,
    })
}

/// Longest delay representable on the item timeline.
const MAX_DELAY_DAYS: i64 = 3650;

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(MAX_DELAY_DAYS))
}

/// Mutex-guarded queue that wakes idle workers through a [`Notify`].
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, items: Vec<NewBatchItem>) -> Result<Vec<DbId>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(items.len());
        for new in items {
            state.next_id += 1;
            let id = state.next_id;
            state.items.insert(
                id,
                BatchItem {
                    id,
                    batch_id: new.batch_id,
                    position: new.position,
                    payload: new.payload,
                    status: ItemStatus::Queued,
                    attempt_count: 0,
                    max_attempts: new.max_attempts,
                    last_error: None,
                    result_ref: None,
                    available_at: now,
                    lease_id: None,
                    leased_by: None,
                    lease_expires_at: None,
                    created_at: now,
                },
            );
            state.open.insert(id);
            ids.push(id);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(id) = state.next_ready(now) else {
            return Ok(None);
        };

        let lease_id = Uuid::new_v4();
        let expires_at = now + to_chrono(lease_duration);
        state.leases.insert(lease_id, id);
        let Some(item) = state.items.get_mut(&id) else {
            return Ok(None);
        };
        item.status = ItemStatus::Leased;
        item.attempt_count += 1;
        item.lease_id = Some(lease_id);
        item.leased_by = Some(worker_id.to_string());
        item.lease_expires_at = Some(expires_at);

        Ok(Some(Lease {
            id: lease_id,
            item: item.clone(),
            worker_id: worker_id.to_string(),
            expires_at,
        }))
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        // Register for wakeups before looking at the queue, so an enqueue
        // that lands between the look and the wait is not missed.
        let mut notified = pin!(self.notify.notified());
        notified.as_mut().enable();

        let wait = match self.state.lock().await.earliest_available() {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(max_wait),
            None => max_wait,
        };
        if wait.is_zero() {
            return;
        }
        let _ = tokio::time::timeout(wait, notified).await;
    }

    async fn is_held(&self, lease_id: LeaseId) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        Ok(state
            .find_leased(lease_id)
            .is_ok_and(|item| item.lease_expires_at.is_some_and(|at| at > now)))
    }

    async fn ack(&self, lease_id: LeaseId, result_ref: DbId) -> Result<TerminalItem, QueueError> {
        let mut state = self.state.lock().await;
        let item = state.find_leased(lease_id)?;
        item.status = ItemStatus::Succeeded;
        item.result_ref = Some(result_ref);
        let id = item.id;
        state
            .settle(id)
            .ok_or_else(|| QueueError::Storage("acked item is not terminal".into()))
    }

    async fn nack(&self, lease_id: LeaseId, nack: Nack) -> Result<Option<TerminalItem>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let snapshot = state.find_leased(lease_id)?.clone();

        let (status, error, available_at) = match nack {
            Nack::Requeue { delay, error } => {
                let (status, halt_error) = state.requeue_target(&snapshot);
                (status, halt_error.unwrap_or(error), now + to_chrono(delay))
            }
            Nack::Fail { error } => (ItemStatus::Failed, error, snapshot.available_at),
            Nack::Skip { reason } => (ItemStatus::Skipped, reason, snapshot.available_at),
        };

        let item = state.find_leased(lease_id)?;
        item.status = status;
        item.last_error = Some(error);
        item.available_at = available_at;
        let transition = state.settle(snapshot.id);
        drop(state);

        if transition.is_none() {
            self.notify.notify_waiters();
        }
        Ok(transition)
    }

    async fn reclaim_expired_leases(&self) -> Result<ReclaimReport, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired: Vec<BatchItem> = state
            .open_items()
            .filter(|item| {
                item.status == ItemStatus::Leased
                    && item.lease_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect();

        let mut report = ReclaimReport::default();
        for snapshot in expired {
            let (status, halt_error) = state.requeue_target(&snapshot);
            let holder = snapshot.leased_by.clone().unwrap_or_default();
            let Some(item) = state.items.get_mut(&snapshot.id) else {
                continue;
            };
            item.status = status;
            item.last_error = Some(halt_error.unwrap_or_else(|| {
                describe_error(error_kind::LEASE_EXPIRED, format!("lease held by {holder} expired"))
            }));
            item.available_at = now;
            match state.settle(snapshot.id) {
                Some(t) => report.terminal.push(t),
                None => report.requeued += 1,
            }
        }
        drop(state);

        if report.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(report)
    }

    async fn halt_batch(&self, batch_id: DbId, halt: Halt) -> Result<Vec<TerminalItem>, QueueError> {
        let mut state = self.state.lock().await;
        let halt = state.halted.entry(batch_id).or_insert(halt).clone();
        let (status, error) = match halt {
            Halt::Cancelled => (
                ItemStatus::Skipped,
                describe_error(error_kind::CANCELLED, "batch cancelled"),
            ),
            Halt::Aborted(reason) => (ItemStatus::Failed, reason),
        };

        let queued: Vec<DbId> = state
            .open_items()
            .filter(|item| item.batch_id == batch_id && item.status == ItemStatus::Queued)
            .map(|item| item.id)
            .collect();

        let mut transitions = Vec::with_capacity(queued.len());
        for id in queued {
            if let Some(item) = state.items.get_mut(&id) {
                item.status = status;
                item.last_error = Some(error.clone());
            }
            transitions.extend(state.settle(id));
        }
        state.forget_idle_halt(batch_id);
        Ok(transitions)
    }

    async fn items(&self, batch_id: DbId) -> Result<Vec<BatchItem>, QueueError> {
        let state = self.state.lock().await;
        let mut items: Vec<BatchItem> = state
            .items
            .values()
            .filter(|item| item.batch_id == batch_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.position);
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Batch store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    batches: HashMap<DbId, BatchExecution>,
    credentials: HashMap<DbId, SealedCredential>,
    /// Items whose outcome is already in the counters.
    counted: HashSet<DbId>,
    next_id: DbId,
}

/// Mutex-guarded batch records. Counter rules come from
/// [`BatchExecution::apply_outcome`].
#[derive(Default)]
pub struct MemoryBatchStore {
    state: Mutex<StoreState>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn create_batch(&self, input: NewBatch) -> Result<BatchExecution, StoreError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let batch = BatchExecution {
            id: state.next_id,
            owner_id: input.owner_id,
            status: BatchStatus::Queued,
            total_items: input.total_items,
            succeeded_count: 0,
            failed_count: 0,
            skipped_count: 0,
            cancel_requested: false,
            abort_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        state.batches.insert(batch.id, batch.clone());
        state.credentials.insert(batch.id, input.credential);
        Ok(batch)
    }

    async fn find(&self, id: DbId) -> Result<Option<BatchExecution>, StoreError> {
        Ok(self.state.lock().await.batches.get(&id).cloned())
    }

    async fn record_outcome(&self, item: &TerminalItem) -> Result<Option<BatchExecution>, StoreError> {
        let mut state = self.state.lock().await;
        let StoreState {
            batches,
            credentials,
            counted,
            ..
        } = &mut *state;
        let Some(batch) = batches.get_mut(&item.batch_id) else {
            return Ok(None);
        };
        if batch.pending() <= 0 || !counted.insert(item.item_id) {
            return Ok(None);
        }
        if batch.apply_outcome(item.outcome, Utc::now()) {
            credentials.remove(&item.batch_id);
        }
        Ok(Some(batch.clone()))
    }

    async fn abandon(&self, id: DbId, reason: &str) -> Result<Option<BatchExecution>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(batch) = state.batches.get_mut(&id) else {
            return Ok(None);
        };
        if !batch.abandon(reason, Utc::now()) {
            return Ok(None);
        }
        let batch = batch.clone();
        state.credentials.remove(&id);
        Ok(Some(batch))
    }

    async fn mark_running(&self, id: DbId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .batches
            .get_mut(&id)
            .is_some_and(BatchExecution::mark_running))
    }

    async fn request_cancel(&self, id: DbId) -> Result<Option<BatchExecution>, StoreError> {
        let mut state = self.state.lock().await;
        match state.batches.get_mut(&id) {
            Some(batch) if !batch.status.is_terminal() => {
                batch.cancel_requested = true;
                Ok(Some(batch.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn abort(&self, id: DbId, reason: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.batches.get_mut(&id) {
            Some(batch) if !batch.status.is_terminal() => {
                batch.abort_reason.get_or_insert_with(|| reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn credential(&self, id: DbId) -> Result<Option<SealedCredential>, StoreError> {
        Ok(self.state.lock().await.credentials.get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

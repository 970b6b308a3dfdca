//! Public entry point: submit, inspect, and cancel batches.
//!
//! Submission validates the whole batch up front, persists the batch record
//! with its sealed credential, enqueues every item, and returns without
//! waiting for execution.

use std::collections::HashSet;
use std::time::Duration;

use genbatch_core::batch::{
    describe_error, error_kind, validate_batch, BatchItem, ItemPayload, NewBatch, NewBatchItem,
    ProgressSnapshot, ResultAsset, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BATCH_SIZE,
};
use genbatch_core::credentials::SealedCredential;
use genbatch_core::status::ItemStatus;
use genbatch_core::types::DbId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::context::PipelineContext;
use crate::error::{BatchError, StoreError};
use crate::progress::BatchEvent;
use crate::queue::Halt;

/// Limits applied at submission.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_batch_size: usize,
    /// External calls allowed per item, including the first.
    pub max_attempts: i32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// A batch submission. `credential` is the caller's API key, already sealed
/// with the engine's vault.
#[derive(Debug, Clone)]
pub struct SubmitBatch {
    pub owner_id: DbId,
    pub credential: SealedCredential,
    pub items: Vec<ItemPayload>,
}

/// Accepts batches and answers status queries.
pub struct BatchCoordinator {
    ctx: PipelineContext,
    config: CoordinatorConfig,
}

impl BatchCoordinator {
    pub fn new(ctx: PipelineContext, config: CoordinatorConfig) -> Self {
        Self { ctx, config }
    }

    /// Validate, persist, and enqueue a batch. Returns its ID.
    ///
    /// Fails without creating anything if any item is invalid or the
    /// credential does not open.
    pub async fn submit(&self, request: SubmitBatch) -> Result<DbId, BatchError> {
        validate_batch(&request.items, self.config.max_batch_size)?;
        // Opened only to prove it is usable; the plaintext is wiped on drop.
        self.ctx.vault.open(&request.credential)?;

        let total_items = request.items.len() as i32;
        let batch = self
            .ctx
            .store
            .create_batch(NewBatch {
                owner_id: request.owner_id,
                total_items,
                credential: request.credential,
            })
            .await?;

        let items = request
            .items
            .into_iter()
            .enumerate()
            .map(|(position, payload)| NewBatchItem {
                batch_id: batch.id,
                position: position as i32,
                payload,
                max_attempts: self.config.max_attempts,
            })
            .collect();

        if let Err(e) = self.ctx.queue.enqueue(items).await {
            // No item exists, so no per-item outcome will drain the batch.
            tracing::error!(batch_id = batch.id, error = %e, "Failed to enqueue batch items");
            let reason = describe_error(error_kind::STORAGE, &e);
            self.ctx.tracker.on_batch_abandoned(batch.id, &reason).await?;
            return Err(e.into());
        }

        tracing::info!(
            batch_id = batch.id,
            owner_id = request.owner_id,
            total_items,
            "Batch submitted",
        );
        Ok(batch.id)
    }

    /// Request cancellation. Queued items are skipped at once; items in
    /// flight finish and are not retried. Succeeded items are kept.
    ///
    /// Returns `false` if the batch is already terminal.
    pub async fn cancel(&self, batch_id: DbId) -> Result<bool, BatchError> {
        if self.ctx.store.request_cancel(batch_id).await?.is_none() {
            return match self.ctx.store.find(batch_id).await? {
                Some(_) => Ok(false),
                None => Err(BatchError::NotFound(batch_id)),
            };
        }

        let skipped = self.ctx.queue.halt_batch(batch_id, Halt::Cancelled).await?;
        tracing::info!(batch_id, skipped = skipped.len(), "Batch cancellation requested");
        self.ctx.tracker.report_all(&skipped).await;
        Ok(true)
    }

    pub async fn get_status(&self, batch_id: DbId) -> Result<ProgressSnapshot, BatchError> {
        Ok(self.ctx.tracker.snapshot(batch_id).await?)
    }

    /// Results of the items that succeeded so far, in item order.
    ///
    /// Only assets an item committed to on ack are returned; output left
    /// by a delivery that lost its lease is never visible.
    pub async fn get_results(&self, batch_id: DbId) -> Result<Vec<ResultAsset>, BatchError> {
        self.ensure_exists(batch_id).await?;
        let committed: HashSet<DbId> = self
            .ctx
            .queue
            .items(batch_id)
            .await?
            .iter()
            .filter(|item| item.status == ItemStatus::Succeeded)
            .filter_map(|item| item.result_ref)
            .collect();
        let results = self.ctx.results.list(batch_id).await?;
        Ok(results
            .into_iter()
            .filter(|asset| committed.contains(&asset.id))
            .collect())
    }

    /// Every item with its status, attempts, and last error.
    pub async fn get_items(&self, batch_id: DbId) -> Result<Vec<BatchItem>, BatchError> {
        self.ensure_exists(batch_id).await?;
        Ok(self.ctx.queue.items(batch_id).await?)
    }

    /// Wait until the batch is terminal or `timeout` elapses.
    pub async fn wait_for_terminal(
        &self,
        batch_id: DbId,
        timeout: Duration,
    ) -> Result<ProgressSnapshot, BatchError> {
        // Subscribe before reading the snapshot so the terminal event
        // cannot slip in between.
        let mut events = self.ctx.tracker.subscribe();
        let snapshot = self.get_status(batch_id).await?;
        if snapshot.is_terminal() {
            return Ok(snapshot);
        }

        tokio::time::timeout(timeout, self.next_terminal_event(batch_id, &mut events))
            .await
            .map_err(|_| BatchError::Timeout(batch_id))?
    }

    async fn next_terminal_event(
        &self,
        batch_id: DbId,
        events: &mut broadcast::Receiver<BatchEvent>,
    ) -> Result<ProgressSnapshot, BatchError> {
        loop {
            match events.recv().await {
                Ok(BatchEvent::Terminal(s)) if s.batch_id == batch_id => return Ok(s),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(batch_id, missed, "Progress subscriber lagged");
                    let snapshot = self.get_status(batch_id).await?;
                    if snapshot.is_terminal() {
                        return Ok(snapshot);
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(StoreError::Storage("progress channel closed".into()).into())
                }
            }
        }
    }

    async fn ensure_exists(&self, batch_id: DbId) -> Result<(), BatchError> {
        match self.ctx.store.find(batch_id).await? {
            Some(_) => Ok(()),
            None => Err(BatchError::NotFound(batch_id)),
        }
    }
}

//! Postgres-backed [`JobQueue`] and [`BatchStore`] over the repositories in
//! `genbatch-db`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use genbatch_core::batch::{
    describe_error, error_kind, BatchExecution, BatchItem, NewBatch, NewBatchItem, TerminalItem,
};
use genbatch_core::credentials::SealedCredential;
use genbatch_core::status::ItemStatus;
use genbatch_core::types::{DbId, LeaseId};
use genbatch_db::models::item::ItemRow;
use genbatch_db::repositories::{BatchRepo, ItemRepo};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{QueueError, StoreError};
use crate::queue::{Halt, JobQueue, Lease, Nack, ReclaimReport};
use crate::store::BatchStore;

fn terminal_transitions(rows: Vec<ItemRow>) -> Result<Vec<TerminalItem>, QueueError> {
    let mut transitions = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(t) = row.terminal()? {
            transitions.push(t);
        }
    }
    Ok(transitions)
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Durable queue on the `batch_items` table.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, items: Vec<NewBatchItem>) -> Result<Vec<DbId>, QueueError> {
        Ok(ItemRepo::insert_many(&self.pool, &items).await?)
    }

    async fn lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, QueueError> {
        let lease_id = Uuid::new_v4();
        let Some(row) =
            ItemRepo::claim_next(&self.pool, lease_id, worker_id, lease_duration.as_secs_f64())
                .await?
        else {
            return Ok(None);
        };
        let item: BatchItem = row.into_domain()?;
        let expires_at = item.lease_expires_at.unwrap_or_else(Utc::now);
        Ok(Some(Lease {
            id: lease_id,
            item,
            worker_id: worker_id.to_string(),
            expires_at,
        }))
    }

    async fn is_held(&self, lease_id: LeaseId) -> Result<bool, QueueError> {
        Ok(ItemRepo::is_held(&self.pool, lease_id).await?)
    }

    async fn ack(&self, lease_id: LeaseId, result_ref: DbId) -> Result<TerminalItem, QueueError> {
        let row = ItemRepo::complete(&self.pool, lease_id, result_ref)
            .await?
            .ok_or(QueueError::LeaseLost(lease_id))?;
        row.terminal()?
            .ok_or_else(|| QueueError::Storage(format!("item {} is not terminal after ack", row.id)))
    }

    async fn nack(&self, lease_id: LeaseId, nack: Nack) -> Result<Option<TerminalItem>, QueueError> {
        let row = match nack {
            Nack::Requeue { delay, error } => {
                ItemRepo::requeue(&self.pool, lease_id, delay.as_secs_f64(), &error).await?
            }
            Nack::Fail { error } => {
                ItemRepo::finish(&self.pool, lease_id, ItemStatus::Failed, &error).await?
            }
            Nack::Skip { reason } => {
                ItemRepo::finish(&self.pool, lease_id, ItemStatus::Skipped, &reason).await?
            }
        };
        let row = row.ok_or(QueueError::LeaseLost(lease_id))?;
        Ok(row.terminal()?)
    }

    async fn reclaim_expired_leases(&self) -> Result<ReclaimReport, QueueError> {
        let expired_error = describe_error(error_kind::LEASE_EXPIRED, "lease expired before completion");
        let reclaimed = ItemRepo::reclaim_expired(&self.pool, &expired_error).await?;

        let mut report = ReclaimReport::default();
        for row in reclaimed {
            match row.terminal()? {
                Some(t) => report.terminal.push(t),
                None => report.requeued += 1,
            }
        }

        let halted_error = describe_error(error_kind::CANCELLED, "batch cancelled");
        let swept = ItemRepo::finish_halted(&self.pool, &halted_error).await?;
        report.terminal.extend(terminal_transitions(swept)?);
        Ok(report)
    }

    async fn halt_batch(&self, batch_id: DbId, halt: Halt) -> Result<Vec<TerminalItem>, QueueError> {
        let rows = match halt {
            Halt::Cancelled => {
                BatchRepo::request_cancel(&self.pool, batch_id).await?;
                let reason = describe_error(error_kind::CANCELLED, "batch cancelled");
                ItemRepo::finish_queued(&self.pool, batch_id, ItemStatus::Skipped, &reason).await?
            }
            Halt::Aborted(reason) => {
                BatchRepo::abort(&self.pool, batch_id, &reason).await?;
                ItemRepo::finish_queued(&self.pool, batch_id, ItemStatus::Failed, &reason).await?
            }
        };
        terminal_transitions(rows)
    }

    async fn items(&self, batch_id: DbId) -> Result<Vec<BatchItem>, QueueError> {
        let rows = ItemRepo::list_by_batch(&self.pool, batch_id).await?;
        let items = rows
            .into_iter()
            .map(ItemRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Batch store
// ---------------------------------------------------------------------------

/// Batch records on the `batch_executions` table.
#[derive(Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn create_batch(&self, input: NewBatch) -> Result<BatchExecution, StoreError> {
        Ok(BatchRepo::create(&self.pool, &input).await?.into_domain()?)
    }

    async fn find(&self, id: DbId) -> Result<Option<BatchExecution>, StoreError> {
        match BatchRepo::find_by_id(&self.pool, id).await? {
            Some(row) => Ok(Some(row.into_domain()?)),
            None => Ok(None),
        }
    }

    async fn record_outcome(&self, item: &TerminalItem) -> Result<Option<BatchExecution>, StoreError> {
        match BatchRepo::record_outcome(&self.pool, item.batch_id, item.item_id).await? {
            Some(row) => Ok(Some(row.into_domain()?)),
            None => Ok(None),
        }
    }

    async fn abandon(&self, id: DbId, reason: &str) -> Result<Option<BatchExecution>, StoreError> {
        match BatchRepo::abandon(&self.pool, id, reason).await? {
            Some(row) => Ok(Some(row.into_domain()?)),
            None => Ok(None),
        }
    }

    async fn mark_running(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(BatchRepo::mark_running(&self.pool, id).await?)
    }

    async fn request_cancel(&self, id: DbId) -> Result<Option<BatchExecution>, StoreError> {
        match BatchRepo::request_cancel(&self.pool, id).await? {
            Some(row) => Ok(Some(row.into_domain()?)),
            None => Ok(None),
        }
    }

    async fn abort(&self, id: DbId, reason: &str) -> Result<bool, StoreError> {
        Ok(BatchRepo::abort(&self.pool, id, reason).await?)
    }

    async fn credential(&self, id: DbId) -> Result<Option<SealedCredential>, StoreError> {
        Ok(BatchRepo::credential(&self.pool, id).await?)
    }
}

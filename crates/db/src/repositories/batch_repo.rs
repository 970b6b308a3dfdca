//! Repository for the `batch_executions` table.
//!
//! Counter updates are single `UPDATE ... RETURNING` statements so
//! concurrent workers never lose an increment. Each statement also claims
//! the counted items through `batch_items.counted`, so no item is counted
//! twice. The drain rule (status flips to terminal when no item is pending)
//! is evaluated in the same statement.

use genbatch_core::batch::NewBatch;
use genbatch_core::credentials::SealedCredential;
use genbatch_core::status::{BatchStatus, ItemStatus};
use genbatch_core::types::DbId;
use sqlx::PgPool;

use crate::models::batch::{BatchRow, CredentialRow};

/// Column list for `batch_executions` queries.
const COLUMNS: &str = "\
    id, owner_id, status_id, total_items, \
    succeeded_count, failed_count, skipped_count, \
    cancel_requested, abort_reason, created_at, completed_at";

/// Column list qualified with the `b` alias, for statements that join
/// another relation.
const BATCH_COLUMNS: &str = "\
    b.id, b.owner_id, b.status_id, b.total_items, \
    b.succeeded_count, b.failed_count, b.skipped_count, \
    b.cancel_requested, b.abort_reason, b.created_at, b.completed_at";

/// Provides counter and lifecycle operations for batches.
pub struct BatchRepo;

impl BatchRepo {
    /// Insert a new queued batch holding its sealed credential.
    pub async fn create(pool: &PgPool, input: &NewBatch) -> Result<BatchRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO batch_executions \
                 (owner_id, status_id, total_items, credential_ciphertext, credential_nonce) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, BatchRow>(&query)
            .bind(input.owner_id)
            .bind(BatchStatus::Queued.id())
            .bind(input.total_items)
            .bind(&input.credential.ciphertext)
            .bind(&input.credential.nonce)
            .fetch_one(pool)
            .await
    }

    /// Find a batch by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<BatchRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM batch_executions WHERE id = $1");
        sqlx::query_as::<_, BatchRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Move a batch from queued to running. Returns `true` if it moved.
    pub async fn mark_running(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE batch_executions SET status_id = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(BatchStatus::Running.id())
        .bind(BatchStatus::Queued.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count one terminal item and flip the batch to its terminal status
    /// when nothing is left pending. The credential is nulled in the same
    /// statement.
    ///
    /// The item's `counted` flag is set in the same statement, and the
    /// increment is taken from the item's own status, so an outcome is
    /// counted at most once no matter how often (or by whom) it is reported.
    ///
    /// Returns `None` when the item is not terminal, was already counted,
    /// or its batch was already drained.
    pub async fn record_outcome(
        pool: &PgPool,
        batch_id: DbId,
        item_id: DbId,
    ) -> Result<Option<BatchRow>, sqlx::Error> {
        let succeeded = "(m.item_status_id = $2)::INTEGER";
        let failed = "(m.item_status_id = $3)::INTEGER";
        let skipped = "(m.item_status_id = $4)::INTEGER";
        let drained = format!(
            "b.total_items - (b.succeeded_count + {succeeded}) - (b.failed_count + {failed}) \
             - (b.skipped_count + {skipped}) = 0 AND b.status_id NOT IN ($5, $6, $7)"
        );
        let query = format!(
            "WITH m AS ( \
                 UPDATE batch_items SET counted = TRUE \
                 WHERE id = $8 AND batch_id = $1 AND NOT counted AND status_id IN ($2, $3, $4) \
                 RETURNING batch_id, status_id AS item_status_id \
             ) \
             UPDATE batch_executions b SET \
                 succeeded_count = b.succeeded_count + {succeeded}, \
                 failed_count = b.failed_count + {failed}, \
                 skipped_count = b.skipped_count + {skipped}, \
                 status_id = CASE WHEN {drained} THEN \
                     CASE WHEN b.cancel_requested THEN $7 \
                          WHEN b.abort_reason IS NOT NULL OR b.succeeded_count + {succeeded} = 0 THEN $6 \
                          ELSE $5 END \
                     ELSE b.status_id END, \
                 completed_at = CASE WHEN {drained} THEN NOW() ELSE b.completed_at END, \
                 credential_ciphertext = CASE WHEN {drained} THEN NULL ELSE b.credential_ciphertext END, \
                 credential_nonce = CASE WHEN {drained} THEN NULL ELSE b.credential_nonce END, \
                 updated_at = NOW() \
             FROM m \
             WHERE b.id = m.batch_id \
               AND b.succeeded_count + b.failed_count + b.skipped_count < b.total_items \
             RETURNING {BATCH_COLUMNS}"
        );
        sqlx::query_as::<_, BatchRow>(&query)
            .bind(batch_id)
            .bind(ItemStatus::Succeeded.id())
            .bind(ItemStatus::Failed.id())
            .bind(ItemStatus::Skipped.id())
            .bind(BatchStatus::Completed.id())
            .bind(BatchStatus::Failed.id())
            .bind(BatchStatus::Cancelled.id())
            .bind(item_id)
            .fetch_optional(pool)
            .await
    }

    /// Fail every pending item of a batch at once and drain it. Used when
    /// the batch's items were never inserted.
    ///
    /// Returns `None` if the batch is missing or already terminal.
    pub async fn abandon(
        pool: &PgPool,
        id: DbId,
        reason: &str,
    ) -> Result<Option<BatchRow>, sqlx::Error> {
        let query = format!(
            "UPDATE batch_executions SET \
                 failed_count = total_items - succeeded_count - skipped_count, \
                 abort_reason = COALESCE(abort_reason, $2), \
                 status_id = CASE WHEN cancel_requested THEN $3 ELSE $4 END, \
                 completed_at = NOW(), \
                 credential_ciphertext = NULL, \
                 credential_nonce = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, BatchRow>(&query)
            .bind(id)
            .bind(reason)
            .bind(BatchStatus::Cancelled.id())
            .bind(BatchStatus::Failed.id())
            .bind(BatchStatus::Queued.id())
            .bind(BatchStatus::Running.id())
            .fetch_optional(pool)
            .await
    }

    /// Set the cancellation flag on a non-terminal batch.
    ///
    /// Returns `None` if the batch is missing or already terminal.
    pub async fn request_cancel(pool: &PgPool, id: DbId) -> Result<Option<BatchRow>, sqlx::Error> {
        let query = format!(
            "UPDATE batch_executions SET cancel_requested = TRUE, updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, BatchRow>(&query)
            .bind(id)
            .bind(BatchStatus::Queued.id())
            .bind(BatchStatus::Running.id())
            .fetch_optional(pool)
            .await
    }

    /// Record why the whole batch is being failed. The first reason wins.
    pub async fn abort(pool: &PgPool, id: DbId, reason: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE batch_executions \
             SET abort_reason = COALESCE(abort_reason, $2), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($3, $4)",
        )
        .bind(id)
        .bind(reason)
        .bind(BatchStatus::Queued.id())
        .bind(BatchStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch the sealed credential, if it has not been discarded.
    pub async fn credential(pool: &PgPool, id: DbId) -> Result<Option<SealedCredential>, sqlx::Error> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT credential_ciphertext, credential_nonce FROM batch_executions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row.and_then(CredentialRow::into_sealed))
    }

    /// Count every terminal item of a non-terminal batch that was never
    /// counted, draining batches whose items are all terminal.
    ///
    /// Closes the gap left when a process died between an item transition
    /// and its counter update. Items are claimed through their `counted`
    /// flag in the same statement, so this is safe to run while other
    /// processes report outcomes. Returns the number of batches corrected.
    pub async fn reconcile_counters(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let drained = "b.total_items - (b.succeeded_count + c.succeeded) \
                       - (b.failed_count + c.failed) - (b.skipped_count + c.skipped) = 0";
        let query = format!(
            "WITH m AS ( \
                 UPDATE batch_items i SET counted = TRUE \
                 FROM batch_executions e \
                 WHERE e.id = i.batch_id AND e.status_id IN ($4, $5) \
                   AND NOT i.counted AND i.status_id IN ($1, $2, $3) \
                 RETURNING i.batch_id, i.status_id AS item_status_id \
             ), c AS ( \
                 SELECT batch_id, \
                        COUNT(*) FILTER (WHERE item_status_id = $1)::INTEGER AS succeeded, \
                        COUNT(*) FILTER (WHERE item_status_id = $2)::INTEGER AS failed, \
                        COUNT(*) FILTER (WHERE item_status_id = $3)::INTEGER AS skipped \
                 FROM m \
                 GROUP BY batch_id \
             ) \
             UPDATE batch_executions b SET \
                 succeeded_count = b.succeeded_count + c.succeeded, \
                 failed_count = b.failed_count + c.failed, \
                 skipped_count = b.skipped_count + c.skipped, \
                 status_id = CASE WHEN {drained} THEN \
                     CASE WHEN b.cancel_requested THEN $8 \
                          WHEN b.abort_reason IS NOT NULL OR b.succeeded_count + c.succeeded = 0 THEN $7 \
                          ELSE $6 END \
                     ELSE b.status_id END, \
                 completed_at = CASE WHEN {drained} THEN NOW() ELSE b.completed_at END, \
                 credential_ciphertext = CASE WHEN {drained} THEN NULL ELSE b.credential_ciphertext END, \
                 credential_nonce = CASE WHEN {drained} THEN NULL ELSE b.credential_nonce END, \
                 updated_at = NOW() \
             FROM c \
             WHERE b.id = c.batch_id"
        );
        let result = sqlx::query(&query)
            .bind(ItemStatus::Succeeded.id())
            .bind(ItemStatus::Failed.id())
            .bind(ItemStatus::Skipped.id())
            .bind(BatchStatus::Queued.id())
            .bind(BatchStatus::Running.id())
            .bind(BatchStatus::Completed.id())
            .bind(BatchStatus::Failed.id())
            .bind(BatchStatus::Cancelled.id())
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

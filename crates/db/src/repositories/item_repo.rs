//! Repository for the `batch_items` table, which doubles as the durable
//! work queue.
//!
//! Leasing uses `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent workers
//! never claim the same row. Every terminal transition is guarded by the
//! caller's `lease_id`, so a worker whose lease was reclaimed gets `None`
//! back instead of overwriting the new holder's work.

use genbatch_core::batch::NewBatchItem;
use genbatch_core::status::ItemStatus;
use genbatch_core::types::{DbId, LeaseId};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::item::ItemRow;

/// Column list for `batch_items` queries.
const COLUMNS: &str = "\
    id, batch_id, position, payload, status_id, attempt_count, max_attempts, \
    last_error, result_ref, available_at, lease_id, leased_by, lease_expires_at, \
    created_at";

/// Column list qualified with the `i` alias, for statements that join
/// `batch_executions`.
const ITEM_COLUMNS: &str = "\
    i.id, i.batch_id, i.position, i.payload, i.status_id, i.attempt_count, i.max_attempts, \
    i.last_error, i.result_ref, i.available_at, i.lease_id, i.leased_by, i.lease_expires_at, \
    i.created_at";

/// Status the item takes when its lease ends without success: skipped for
/// cancelled batches, failed for aborted batches or exhausted attempts,
/// otherwise back to queued. Arguments are the placeholders bound to the
/// status ids.
fn requeue_status_case(queued: &str, failed: &str, skipped: &str) -> String {
    format!(
        "CASE WHEN b.cancel_requested THEN {skipped} \
              WHEN b.abort_reason IS NOT NULL OR i.attempt_count >= i.max_attempts THEN {failed} \
              ELSE {queued} END"
    )
}

/// Provides queue operations over batch items.
pub struct ItemRepo;

impl ItemRepo {
    /// Insert items in one transaction. Returns their IDs in input order.
    pub async fn insert_many(
        pool: &PgPool,
        items: &[NewBatchItem],
    ) -> Result<Vec<DbId>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id: DbId = sqlx::query_scalar(
                "INSERT INTO batch_items (batch_id, position, payload, status_id, max_attempts) \
                 VALUES ($1, $2, $3, $4, $5) \
                 RETURNING id",
            )
            .bind(item.batch_id)
            .bind(item.position)
            .bind(Json(&item.payload))
            .bind(ItemStatus::Queued.id())
            .bind(item.max_attempts)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Atomically lease the oldest available item.
    ///
    /// Skips items whose backoff has not elapsed, items that used all their
    /// attempts, and items of cancelled or aborted batches. Increments
    /// `attempt_count`.
    pub async fn claim_next(
        pool: &PgPool,
        lease_id: LeaseId,
        worker_id: &str,
        lease_secs: f64,
    ) -> Result<Option<ItemRow>, sqlx::Error> {
        let query = format!(
            "UPDATE batch_items \
             SET status_id = $1, lease_id = $2, leased_by = $3, \
                 lease_expires_at = NOW() + make_interval(secs => $4), \
                 attempt_count = attempt_count + 1, updated_at = NOW() \
             WHERE id = ( \
                 SELECT i.id FROM batch_items i \
                 JOIN batch_executions b ON b.id = i.batch_id \
                 WHERE i.status_id = $5 \
                   AND i.available_at <= NOW() \
                   AND i.attempt_count < i.max_attempts \
                   AND NOT b.cancel_requested \
                   AND b.abort_reason IS NULL \
                 ORDER BY i.available_at ASC, i.id ASC \
                 LIMIT 1 \
                 FOR UPDATE OF i SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(ItemStatus::Leased.id())
            .bind(lease_id)
            .bind(worker_id)
            .bind(lease_secs)
            .bind(ItemStatus::Queued.id())
            .fetch_optional(pool)
            .await
    }

    /// Whether `lease_id` is still the unexpired lease of a leased item.
    pub async fn is_held(pool: &PgPool, lease_id: LeaseId) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT 1 FROM batch_items \
                 WHERE lease_id = $1 AND status_id = $2 AND lease_expires_at > NOW() \
             )",
        )
        .bind(lease_id)
        .bind(ItemStatus::Leased.id())
        .fetch_one(pool)
        .await
    }

    /// Mark a leased item succeeded and link its result.
    pub async fn complete(
        pool: &PgPool,
        lease_id: LeaseId,
        result_ref: DbId,
    ) -> Result<Option<ItemRow>, sqlx::Error> {
        let query = format!(
            "UPDATE batch_items \
             SET status_id = $2, result_ref = $3, \
                 lease_id = NULL, leased_by = NULL, lease_expires_at = NULL, \
                 updated_at = NOW() \
             WHERE lease_id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(lease_id)
            .bind(ItemStatus::Succeeded.id())
            .bind(result_ref)
            .bind(ItemStatus::Leased.id())
            .fetch_optional(pool)
            .await
    }

    /// End a lease with a terminal failure or skip.
    pub async fn finish(
        pool: &PgPool,
        lease_id: LeaseId,
        status: ItemStatus,
        error: &str,
    ) -> Result<Option<ItemRow>, sqlx::Error> {
        let query = format!(
            "UPDATE batch_items \
             SET status_id = $2, last_error = $3, \
                 lease_id = NULL, leased_by = NULL, lease_expires_at = NULL, \
                 updated_at = NOW() \
             WHERE lease_id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(lease_id)
            .bind(status.id())
            .bind(error)
            .bind(ItemStatus::Leased.id())
            .fetch_optional(pool)
            .await
    }

    /// Return a leased item to the queue after `delay_secs`, unless the
    /// batch was halted or the item has no attempts left, in which case it
    /// becomes terminal in the same statement.
    pub async fn requeue(
        pool: &PgPool,
        lease_id: LeaseId,
        delay_secs: f64,
        error: &str,
    ) -> Result<Option<ItemRow>, sqlx::Error> {
        let status = requeue_status_case("$4", "$5", "$6");
        let query = format!(
            "UPDATE batch_items i \
             SET status_id = {status}, last_error = $2, \
                 available_at = NOW() + make_interval(secs => $3), \
                 lease_id = NULL, leased_by = NULL, lease_expires_at = NULL, \
                 updated_at = NOW() \
             FROM batch_executions b \
             WHERE b.id = i.batch_id AND i.lease_id = $1 AND i.status_id = $7 \
             RETURNING {ITEM_COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(lease_id)
            .bind(error)
            .bind(delay_secs)
            .bind(ItemStatus::Queued.id())
            .bind(ItemStatus::Failed.id())
            .bind(ItemStatus::Skipped.id())
            .bind(ItemStatus::Leased.id())
            .fetch_optional(pool)
            .await
    }

    /// Release every lease whose expiry has passed.
    ///
    /// Items go back to the queue immediately unless their batch was halted
    /// or they used their last attempt.
    pub async fn reclaim_expired(pool: &PgPool, error: &str) -> Result<Vec<ItemRow>, sqlx::Error> {
        let status = requeue_status_case("$2", "$3", "$4");
        let query = format!(
            "UPDATE batch_items i \
             SET status_id = {status}, last_error = $1, available_at = NOW(), \
                 lease_id = NULL, leased_by = NULL, lease_expires_at = NULL, \
                 updated_at = NOW() \
             FROM batch_executions b \
             WHERE b.id = i.batch_id AND i.status_id = $5 AND i.lease_expires_at < NOW() \
             RETURNING {ITEM_COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(error)
            .bind(ItemStatus::Queued.id())
            .bind(ItemStatus::Failed.id())
            .bind(ItemStatus::Skipped.id())
            .bind(ItemStatus::Leased.id())
            .fetch_all(pool)
            .await
    }

    /// Move every still-queued item of a batch to `status` (skipped or
    /// failed). Leased items are left to their holders.
    pub async fn finish_queued(
        pool: &PgPool,
        batch_id: DbId,
        status: ItemStatus,
        error: &str,
    ) -> Result<Vec<ItemRow>, sqlx::Error> {
        let query = format!(
            "UPDATE batch_items \
             SET status_id = $2, last_error = $3, updated_at = NOW() \
             WHERE batch_id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(batch_id)
            .bind(status.id())
            .bind(error)
            .bind(ItemStatus::Queued.id())
            .fetch_all(pool)
            .await
    }

    /// Finish queued items of every cancelled or aborted batch.
    ///
    /// Catches items that were requeued while their batch was being halted.
    pub async fn finish_halted(pool: &PgPool, error: &str) -> Result<Vec<ItemRow>, sqlx::Error> {
        let query = format!(
            "UPDATE batch_items i \
             SET status_id = CASE WHEN b.cancel_requested THEN $2 ELSE $3 END, \
                 last_error = COALESCE(b.abort_reason, $1), updated_at = NOW() \
             FROM batch_executions b \
             WHERE b.id = i.batch_id AND i.status_id = $4 \
               AND (b.cancel_requested OR b.abort_reason IS NOT NULL) \
             RETURNING {ITEM_COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(error)
            .bind(ItemStatus::Skipped.id())
            .bind(ItemStatus::Failed.id())
            .bind(ItemStatus::Queued.id())
            .fetch_all(pool)
            .await
    }

    /// List a batch's items in submission order.
    pub async fn list_by_batch(pool: &PgPool, batch_id: DbId) -> Result<Vec<ItemRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM batch_items WHERE batch_id = $1 ORDER BY position ASC"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(batch_id)
            .fetch_all(pool)
            .await
    }
}

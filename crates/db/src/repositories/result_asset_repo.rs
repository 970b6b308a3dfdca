//! Repository for the `result_assets` table.

use genbatch_core::types::DbId;
use sqlx::PgPool;

use crate::models::result_asset::{CreateResultAsset, ResultAssetRow};

/// Column list for `result_assets` queries.
const COLUMNS: &str = "\
    id, item_id, batch_id, attempt, storage_path, content_type, size_bytes, checksum, created_at";

/// Provides persistence for generation outputs.
pub struct ResultAssetRepo;

impl ResultAssetRepo {
    /// Record a stored result, or return the existing row for the same
    /// delivery.
    ///
    /// At most one result exists per `(item_id, attempt)`, so a retried save
    /// of one delivery gets the first row back. Different deliveries never
    /// share a row.
    pub async fn insert_or_get(
        pool: &PgPool,
        input: &CreateResultAsset,
    ) -> Result<ResultAssetRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO result_assets \
                 (item_id, batch_id, attempt, storage_path, content_type, size_bytes, checksum) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (item_id, attempt) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, ResultAssetRow>(&query)
            .bind(input.item_id)
            .bind(input.batch_id)
            .bind(input.attempt)
            .bind(&input.storage_path)
            .bind(&input.content_type)
            .bind(input.size_bytes)
            .bind(&input.checksum)
            .fetch_optional(pool)
            .await?;

        match inserted {
            Some(row) => Ok(row),
            None => {
                let query = format!(
                    "SELECT {COLUMNS} FROM result_assets WHERE item_id = $1 AND attempt = $2"
                );
                sqlx::query_as::<_, ResultAssetRow>(&query)
                    .bind(input.item_id)
                    .bind(input.attempt)
                    .fetch_one(pool)
                    .await
            }
        }
    }

    /// Find the result recorded for one delivery of an item.
    pub async fn find_by_delivery(
        pool: &PgPool,
        item_id: DbId,
        attempt: i32,
    ) -> Result<Option<ResultAssetRow>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM result_assets WHERE item_id = $1 AND attempt = $2");
        sqlx::query_as::<_, ResultAssetRow>(&query)
            .bind(item_id)
            .bind(attempt)
            .fetch_optional(pool)
            .await
    }

    /// List a batch's committed results in item submission order.
    ///
    /// Only rows an item points at through `result_ref` are returned, so
    /// outputs of deliveries that lost their lease never show up.
    pub async fn list_by_batch(
        pool: &PgPool,
        batch_id: DbId,
    ) -> Result<Vec<ResultAssetRow>, sqlx::Error> {
        let query = format!(
            "SELECT r.id, r.item_id, r.batch_id, r.attempt, r.storage_path, r.content_type, \
                    r.size_bytes, r.checksum, r.created_at \
             FROM result_assets r \
             JOIN batch_items i ON i.id = r.item_id AND i.result_ref = r.id \
             WHERE r.batch_id = $1 \
             ORDER BY i.position ASC"
        );
        sqlx::query_as::<_, ResultAssetRow>(&query)
            .bind(batch_id)
            .fetch_all(pool)
            .await
    }

    /// Delete a result no item refers to. Returns the deleted row, or `None`
    /// if it is missing or was committed by an ack.
    pub async fn delete_unreferenced(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<ResultAssetRow>, sqlx::Error> {
        let query = format!(
            "DELETE FROM result_assets r \
             WHERE r.id = $1 \
               AND NOT EXISTS (SELECT 1 FROM batch_items i WHERE i.result_ref = r.id) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ResultAssetRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}

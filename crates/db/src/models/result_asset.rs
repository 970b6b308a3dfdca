//! Row model and insert DTO for the `result_assets` table.

use genbatch_core::batch::ResultAsset;
use genbatch_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `result_assets` table.
#[derive(Debug, Clone, FromRow)]
pub struct ResultAssetRow {
    pub id: DbId,
    pub item_id: DbId,
    pub batch_id: DbId,
    pub attempt: i32,
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: Timestamp,
}

impl From<ResultAssetRow> for ResultAsset {
    fn from(row: ResultAssetRow) -> Self {
        Self {
            id: row.id,
            item_id: row.item_id,
            batch_id: row.batch_id,
            attempt: row.attempt,
            storage_path: row.storage_path,
            content_type: row.content_type,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            created_at: row.created_at,
        }
    }
}

/// DTO for recording a stored result.
#[derive(Debug, Clone)]
pub struct CreateResultAsset {
    pub item_id: DbId,
    pub batch_id: DbId,
    pub attempt: i32,
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
}

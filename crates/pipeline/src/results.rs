//! Persistence of generated outputs.
//!
//! Saving is idempotent per delivery: a retried save of the same
//! `(item, attempt)` returns the first result. Each delivery writes its own
//! blob, so a stale holder and the current one never share a file. Outputs
//! of a delivery that lost its lease are removed with
//! [`ResultStore::discard`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use genbatch_core::batch::{BatchItem, ResultAsset};
use genbatch_core::generation::GeneratedImage;
use genbatch_core::hashing::sha256_hex;
use genbatch_core::types::DbId;
use genbatch_db::models::result_asset::CreateResultAsset;
use genbatch_db::repositories::ResultAssetRepo;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::StorageError;

/// Storage for generation results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist the output of one delivery of `item`. Returns the existing
    /// asset if this delivery already stored one.
    async fn save(&self, item: &BatchItem, image: &GeneratedImage) -> Result<ResultAsset, StorageError>;

    /// Results of a batch in item order. Partial while the batch runs.
    async fn list(&self, batch_id: DbId) -> Result<Vec<ResultAsset>, StorageError>;

    /// Remove an asset no item has committed to. Returns `false` if it was
    /// already gone or is referenced.
    async fn discard(&self, asset: &ResultAsset) -> Result<bool, StorageError>;
}

/// Relative storage path of one delivery's blob:
/// `<batch_id>/<item_id>-<attempt>.<ext>`.
pub fn blob_path(item: &BatchItem, image: &GeneratedImage) -> String {
    format!(
        "{}/{}-{}.{}",
        item.batch_id,
        item.id,
        item.attempt_count,
        image.extension()
    )
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

type DeliveryKey = (DbId, i32);

#[derive(Default)]
struct MemoryResults {
    by_delivery: BTreeMap<DeliveryKey, (i32, ResultAsset)>,
    blobs: BTreeMap<DeliveryKey, Vec<u8>>,
    next_id: DbId,
}

/// Keeps results and their bytes in memory.
#[derive(Default)]
pub struct MemoryResultStore {
    state: Mutex<MemoryResults>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes of one delivery's result.
    pub async fn blob(&self, item_id: DbId, attempt: i32) -> Option<Vec<u8>> {
        self.state.lock().await.blobs.get(&(item_id, attempt)).cloned()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, item: &BatchItem, image: &GeneratedImage) -> Result<ResultAsset, StorageError> {
        let key = item.delivery_key();
        let mut state = self.state.lock().await;
        if let Some((_, existing)) = state.by_delivery.get(&key) {
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let asset = ResultAsset {
            id: state.next_id,
            item_id: item.id,
            batch_id: item.batch_id,
            attempt: item.attempt_count,
            storage_path: blob_path(item, image),
            content_type: image.content_type.clone(),
            size_bytes: image.bytes.len() as i64,
            checksum: sha256_hex(&image.bytes),
            created_at: Utc::now(),
        };
        state.by_delivery.insert(key, (item.position, asset.clone()));
        state.blobs.insert(key, image.bytes.clone());
        Ok(asset)
    }

    async fn list(&self, batch_id: DbId) -> Result<Vec<ResultAsset>, StorageError> {
        let state = self.state.lock().await;
        let mut results: Vec<(i32, ResultAsset)> = state
            .by_delivery
            .values()
            .filter(|(_, asset)| asset.batch_id == batch_id)
            .cloned()
            .collect();
        results.sort_by_key(|(position, asset)| (*position, asset.attempt));
        Ok(results.into_iter().map(|(_, asset)| asset).collect())
    }

    async fn discard(&self, asset: &ResultAsset) -> Result<bool, StorageError> {
        let key = (asset.item_id, asset.attempt);
        let mut state = self.state.lock().await;
        match state.by_delivery.get(&key) {
            Some((_, stored)) if stored.id == asset.id => {
                state.by_delivery.remove(&key);
                state.blobs.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem + Postgres
// ---------------------------------------------------------------------------

/// Writes blobs under a root directory and records their metadata in the
/// `result_assets` table.
pub struct FsResultStore {
    root: PathBuf,
    pool: PgPool,
}

impl FsResultStore {
    pub fn new(root: impl Into<PathBuf>, pool: PgPool) -> Self {
        Self {
            root: root.into(),
            pool,
        }
    }
}

/// Write `bytes` to `root/relative`, creating parent directories.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a partial file.
pub async fn write_blob(root: &Path, relative: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
    let target = root.join(relative);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = target.with_extension("partial");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &target).await?;
    Ok(target)
}

/// Delete `root/relative`. A file that is already gone is not an error.
pub async fn remove_blob(root: &Path, relative: &str) -> Result<(), StorageError> {
    match tokio::fs::remove_file(root.join(relative)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn save(&self, item: &BatchItem, image: &GeneratedImage) -> Result<ResultAsset, StorageError> {
        if let Some(existing) =
            ResultAssetRepo::find_by_delivery(&self.pool, item.id, item.attempt_count).await?
        {
            return Ok(existing.into());
        }

        let storage_path = blob_path(item, image);
        write_blob(&self.root, &storage_path, &image.bytes).await?;

        let row = ResultAssetRepo::insert_or_get(
            &self.pool,
            &CreateResultAsset {
                item_id: item.id,
                batch_id: item.batch_id,
                attempt: item.attempt_count,
                storage_path,
                content_type: image.content_type.clone(),
                size_bytes: image.bytes.len() as i64,
                checksum: sha256_hex(&image.bytes),
            },
        )
        .await?;
        tracing::debug!(
            batch_id = item.batch_id,
            item_id = item.id,
            attempt = item.attempt_count,
            path = %row.storage_path,
            "Result stored",
        );
        Ok(row.into())
    }

    async fn list(&self, batch_id: DbId) -> Result<Vec<ResultAsset>, StorageError> {
        let rows = ResultAssetRepo::list_by_batch(&self.pool, batch_id).await?;
        Ok(rows.into_iter().map(ResultAsset::from).collect())
    }

    async fn discard(&self, asset: &ResultAsset) -> Result<bool, StorageError> {
        let Some(row) = ResultAssetRepo::delete_unreferenced(&self.pool, asset.id).await? else {
            return Ok(false);
        };
        remove_blob(&self.root, &row.storage_path).await?;
        tracing::debug!(
            batch_id = row.batch_id,
            item_id = row.item_id,
            attempt = row.attempt,
            path = %row.storage_path,
            "Stale result discarded",
        );
        Ok(true)
    }
}

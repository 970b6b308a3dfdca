//! Batch execution model, payload validation, and progress arithmetic.
//!
//! The counter rules in [`BatchExecution::apply_outcome`] are the single
//! definition of when a batch becomes terminal. The in-memory store calls
//! them directly and the Postgres repository mirrors them in SQL.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::credentials::SealedCredential;
use crate::error::CoreError;
use crate::status::{BatchStatus, ItemStatus};
use crate::types::{DbId, LeaseId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default upper bound on the number of items in one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default number of external calls made for one item before it fails.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Prefixes written in front of `BatchItem::last_error` so users (and
/// failure analytics) can tell error families apart.
pub mod error_kind {
    pub const TRANSIENT_API: &str = "transient_api";
    pub const PERMANENT_API: &str = "permanent_api";
    pub const STORAGE: &str = "storage";
    pub const CREDENTIAL: &str = "credential";
    pub const CANCELLED: &str = "cancelled";
    pub const LEASE_EXPIRED: &str = "lease_expired";
}

/// Format an item error as `<kind>: <message>`.
pub fn describe_error(kind: &str, message: impl std::fmt::Display) -> String {
    format!("{kind}: {message}")
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The request carried by one batch item: one prompt, one generated image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ItemPayload {
    #[validate(length(min = 1, max = 4000))]
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 4000))]
    pub negative_prompt: Option<String>,

    /// Storage paths or URLs of reference images passed to the generator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(length(max = 4))]
    pub reference_assets: Vec<String>,
}

impl ItemPayload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            reference_assets: Vec::new(),
        }
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_reference_asset(mut self, reference: impl Into<String>) -> Self {
        self.reference_assets.push(reference.into());
        self
    }

    /// Validate field lengths and reject blank prompts or references.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation(
                "Prompt must not be blank".to_string(),
            ));
        }
        for (i, reference) in self.reference_assets.iter().enumerate() {
            if reference.trim().is_empty() {
                return Err(CoreError::Validation(format!(
                    "Reference asset at index {i} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Validate a whole submission: `1..=max_batch_size` items, each well-formed.
///
/// Errors name the offending item index so the caller can surface it.
pub fn validate_batch(items: &[ItemPayload], max_batch_size: usize) -> Result<(), CoreError> {
    if items.is_empty() {
        return Err(CoreError::Validation(
            "Batch must contain at least one item".to_string(),
        ));
    }
    if items.len() > max_batch_size {
        return Err(CoreError::Validation(format!(
            "Batch contains {} items; the maximum is {max_batch_size}",
            items.len()
        )));
    }
    for (i, item) in items.iter().enumerate() {
        item.check().map_err(|e| match e {
            CoreError::Validation(msg) => CoreError::Validation(format!("Item {i}: {msg}")),
            other => other,
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Batch execution
// ---------------------------------------------------------------------------

/// Input for creating a batch record.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub owner_id: DbId,
    pub total_items: i32,
    pub credential: SealedCredential,
}

/// How one item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded,
    Failed,
    /// Deliberately not processed because the batch was cancelled.
    Skipped,
}

impl ItemOutcome {
    pub fn item_status(self) -> ItemStatus {
        match self {
            Self::Succeeded => ItemStatus::Succeeded,
            Self::Failed => ItemStatus::Failed,
            Self::Skipped => ItemStatus::Skipped,
        }
    }
}

/// A batch item that just reached a terminal status.
///
/// Returned by the queue exactly once per terminal transition; the holder is
/// responsible for reporting it to the progress tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalItem {
    pub item_id: DbId,
    pub batch_id: DbId,
    pub outcome: ItemOutcome,
    pub attempt_count: i32,
}

/// Decide the terminal status of a drained batch.
pub fn terminal_status(succeeded: i32, cancel_requested: bool, aborted: bool) -> BatchStatus {
    if cancel_requested {
        BatchStatus::Cancelled
    } else if aborted || succeeded == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::Completed
    }
}

/// A row of the `batch_executions` table.
#[derive(Debug, Clone, Serialize)]
pub struct BatchExecution {
    pub id: DbId,
    pub owner_id: DbId,
    pub status: BatchStatus,
    pub total_items: i32,
    pub succeeded_count: i32,
    pub failed_count: i32,
    pub skipped_count: i32,
    pub cancel_requested: bool,
    /// Set when the whole batch was failed, e.g. by an unusable credential.
    pub abort_reason: Option<String>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl BatchExecution {
    /// Items that have not reached a terminal status yet.
    pub fn pending(&self) -> i32 {
        self.total_items - self.succeeded_count - self.failed_count - self.skipped_count
    }

    /// Count one terminal item.
    ///
    /// Returns `true` when this call drained the batch and moved it to a
    /// terminal status. Outcomes arriving after the batch is drained are
    /// ignored so the counters can never exceed `total_items`.
    pub fn apply_outcome(&mut self, outcome: ItemOutcome, now: Timestamp) -> bool {
        if self.pending() <= 0 {
            return false;
        }
        match outcome {
            ItemOutcome::Succeeded => self.succeeded_count += 1,
            ItemOutcome::Failed => self.failed_count += 1,
            ItemOutcome::Skipped => self.skipped_count += 1,
        }
        if self.pending() == 0 && !self.status.is_terminal() {
            self.status = terminal_status(
                self.succeeded_count,
                self.cancel_requested,
                self.abort_reason.is_some(),
            );
            self.completed_at = Some(now);
            return true;
        }
        false
    }

    /// Fail every pending item at once and drain the batch. Used when the
    /// items never made it into the queue, so no per-item outcome will
    /// ever be reported.
    ///
    /// Returns `false` if the batch was already drained.
    pub fn abandon(&mut self, reason: &str, now: Timestamp) -> bool {
        let pending = self.pending();
        if pending <= 0 || self.status.is_terminal() {
            return false;
        }
        self.abort_reason.get_or_insert_with(|| reason.to_string());
        self.failed_count += pending;
        self.status = terminal_status(self.succeeded_count, self.cancel_requested, true);
        self.completed_at = Some(now);
        true
    }

    /// `queued -> running`; a no-op in any other status.
    pub fn mark_running(&mut self) -> bool {
        if self.status == BatchStatus::Queued {
            self.status = BatchStatus::Running;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            batch_id: self.id,
            total: self.total_items,
            succeeded: self.succeeded_count,
            failed: self.failed_count,
            skipped: self.skipped_count,
            pending: self.pending(),
            status: self.status,
            cancel_requested: self.cancel_requested,
        }
    }
}

/// Point-in-time view of a batch, as returned to polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub batch_id: DbId,
    pub total: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub skipped: i32,
    pub pending: i32,
    pub status: BatchStatus,
    pub cancel_requested: bool,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `succeeded + failed + skipped + pending == total`.
    pub fn is_consistent(&self) -> bool {
        self.succeeded + self.failed + self.skipped + self.pending == self.total
            && self.pending >= 0
    }
}

// ---------------------------------------------------------------------------
// Batch items
// ---------------------------------------------------------------------------

/// Input for enqueuing one item.
#[derive(Debug, Clone)]
pub struct NewBatchItem {
    pub batch_id: DbId,
    pub position: i32,
    pub payload: ItemPayload,
    pub max_attempts: i32,
}

/// One unit of work: a row of the `batch_items` table including its lease
/// metadata.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub id: DbId,
    pub batch_id: DbId,
    /// Zero-based index of the item in the submitted batch.
    pub position: i32,
    pub payload: ItemPayload,
    pub status: ItemStatus,
    /// Number of leases granted so far; each lease is one external call.
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub result_ref: Option<DbId>,
    /// Earliest time the item may be leased again (retry backoff).
    pub available_at: Timestamp,
    pub lease_id: Option<LeaseId>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl BatchItem {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Key that identifies one delivery of this item.
    pub fn delivery_key(&self) -> (DbId, i32) {
        (self.id, self.attempt_count)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Metadata of a persisted generation output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultAsset {
    pub id: DbId,
    pub item_id: DbId,
    pub batch_id: DbId,
    /// Delivery of the item that produced this output.
    pub attempt: i32,
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    /// SHA-256 hex digest of the stored bytes.
    pub checksum: String,
    pub created_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

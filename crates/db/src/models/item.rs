//! Row model for the `batch_items` table.

use genbatch_core::batch::{BatchItem, ItemOutcome, ItemPayload, TerminalItem};
use genbatch_core::status::{ItemStatus, StatusId};
use genbatch_core::types::{DbId, LeaseId, Timestamp};
use sqlx::types::Json;
use sqlx::FromRow;

use super::unknown_status;

/// A row from the `batch_items` table.
#[derive(Debug, Clone, FromRow)]
pub struct ItemRow {
    pub id: DbId,
    pub batch_id: DbId,
    pub position: i32,
    pub payload: Json<ItemPayload>,
    pub status_id: StatusId,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub result_ref: Option<DbId>,
    pub available_at: Timestamp,
    pub lease_id: Option<LeaseId>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl ItemRow {
    pub fn status(&self) -> Result<ItemStatus, sqlx::Error> {
        ItemStatus::from_id(self.status_id)
            .ok_or_else(|| unknown_status("batch_items", self.status_id))
    }

    /// Describe the row as a terminal transition, if its status is terminal.
    pub fn terminal(&self) -> Result<Option<TerminalItem>, sqlx::Error> {
        let outcome = match self.status()? {
            ItemStatus::Succeeded => ItemOutcome::Succeeded,
            ItemStatus::Failed => ItemOutcome::Failed,
            ItemStatus::Skipped => ItemOutcome::Skipped,
            ItemStatus::Queued | ItemStatus::Leased => return Ok(None),
        };
        Ok(Some(TerminalItem {
            item_id: self.id,
            batch_id: self.batch_id,
            outcome,
            attempt_count: self.attempt_count,
        }))
    }

    pub fn into_domain(self) -> Result<BatchItem, sqlx::Error> {
        let status = self.status()?;
        Ok(BatchItem {
            id: self.id,
            batch_id: self.batch_id,
            position: self.position,
            payload: self.payload.0,
            status,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            last_error: self.last_error,
            result_ref: self.result_ref,
            available_at: self.available_at,
            lease_id: self.lease_id,
            leased_by: self.leased_by,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
        })
    }
}

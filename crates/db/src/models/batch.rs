//! Row model for the `batch_executions` table.

use genbatch_core::batch::BatchExecution;
use genbatch_core::credentials::SealedCredential;
use genbatch_core::status::{BatchStatus, StatusId};
use genbatch_core::types::{DbId, Timestamp};
use sqlx::FromRow;

use super::unknown_status;

/// A row from the `batch_executions` table (credential columns excluded).
#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub id: DbId,
    pub owner_id: DbId,
    pub status_id: StatusId,
    pub total_items: i32,
    pub succeeded_count: i32,
    pub failed_count: i32,
    pub skipped_count: i32,
    pub cancel_requested: bool,
    pub abort_reason: Option<String>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl BatchRow {
    pub fn into_domain(self) -> Result<BatchExecution, sqlx::Error> {
        let status = BatchStatus::from_id(self.status_id)
            .ok_or_else(|| unknown_status("batch_executions", self.status_id))?;
        Ok(BatchExecution {
            id: self.id,
            owner_id: self.owner_id,
            status,
            total_items: self.total_items,
            succeeded_count: self.succeeded_count,
            failed_count: self.failed_count,
            skipped_count: self.skipped_count,
            cancel_requested: self.cancel_requested,
            abort_reason: self.abort_reason,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// The sealed credential columns of a batch.
#[derive(Debug, Clone, FromRow)]
pub struct CredentialRow {
    pub credential_ciphertext: Option<Vec<u8>>,
    pub credential_nonce: Option<Vec<u8>>,
}

impl CredentialRow {
    /// `None` once the credential was discarded.
    pub fn into_sealed(self) -> Option<SealedCredential> {
        match (self.credential_ciphertext, self.credential_nonce) {
            (Some(ciphertext), Some(nonce)) => Some(SealedCredential { ciphertext, nonce }),
            _ => None,
        }
    }
}

//! Transfer ledger.
//!
//! Append-only record of every transfer attempt. The ledger is the source of
//! truth for idempotence (one entry per request id) and for recovery (pending
//! entries tell the sweep what was left half done).

use async_trait::async_trait;
use chrono::Duration;
use thiserror::Error;

use crate::Amount;
use crate::journal::JournalError;
use crate::model::{FailureReason, LedgerEntry, LedgerStatus, RequestId};

mod transfer_log;
pub use transfer_log::TransferLog;

/// Error returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Request id already used; carries the prior entry so the caller can
    /// report its outcome instead of re-applying.
    #[error("request {} already recorded as {}", .0.request_id, .0.status)]
    AlreadyExists(Box<LedgerEntry>),

    #[error("request {0} not found")]
    NotFound(RequestId),

    #[error("request {request_id} is already {status}")]
    AlreadyFinal {
        request_id: RequestId,
        status: LedgerStatus,
    },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<JournalError> for LedgerError {
    fn from(e: JournalError) -> Self {
        LedgerError::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record a new pending transfer.
    async fn begin(
        &self,
        request_id: &RequestId,
        sender: &str,
        receiver: &str,
        amount: Amount,
    ) -> Result<LedgerEntry, LedgerError>;

    /// Note that the sender has been debited.
    async fn mark_debited(&self, request_id: &RequestId) -> Result<(), LedgerError>;

    /// Note that the receiver has been credited. From here recovery rolls
    /// the transfer forward instead of refunding it.
    async fn mark_credited(&self, request_id: &RequestId) -> Result<(), LedgerError>;

    async fn commit(&self, request_id: &RequestId) -> Result<(), LedgerError>;

    async fn fail(&self, request_id: &RequestId, reason: FailureReason)
    -> Result<(), LedgerError>;

    async fn get(&self, request_id: &RequestId) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Pending entries not updated within `older_than`, oldest first.
    async fn stale(&self, older_than: Duration) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn status_of(&self, request_id: &RequestId) -> Result<LedgerStatus, LedgerError> {
        Ok(self
            .get(request_id)
            .await?
            .map_or(LedgerStatus::Unknown, |entry| entry.status))
    }
}

//! Error types for transfer processing.

use thiserror::Error;

use crate::Amount;
use crate::ledger::LedgerError;
use crate::model::{AccountNumber, FailureReason, LedgerEntry, RequestId};
use crate::store::StoreError;

/// Error returned by [`Engine::transfer`](super::Engine::transfer).
#[derive(Debug, Error)]
pub enum TransferError {
    // validation, nothing recorded
    #[error("amount must be a positive number of minor units, got {0}")]
    InvalidAmount(i64),

    #[error("account {0} cannot transfer to itself")]
    SelfTransfer(AccountNumber),

    #[error("sender account {0} not found")]
    SenderNotFound(AccountNumber),

    #[error("receiver account {0} not found")]
    ReceiverNotFound(AccountNumber),

    #[error("receiver mobile number does not match account {0}")]
    ReceiverMismatch(AccountNumber),

    #[error("request {0} was already used for a different transfer")]
    RequestIdReused(RequestId),

    // business rejections, recorded as failed
    #[error("insufficient funds in account {account}: requested {requested}")]
    InsufficientFunds {
        account: AccountNumber,
        requested: Amount,
    },

    #[error("crediting {0} would overflow its balance")]
    BalanceOverflow(AccountNumber),

    // transient, safe to retry
    #[error("gave up on account {0} after {1} conflicting updates")]
    Contention(AccountNumber, u32),

    #[error("request {0} is still in progress")]
    InProgress(RequestId),

    #[error("request {0} was abandoned and reconciled; retry with a new request id")]
    Abandoned(RequestId),

    // compensated
    #[error("credit to account {0} failed; the sender was refunded")]
    CreditFailed(AccountNumber),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl TransferError {
    /// The ledger reason recorded when a started transfer ends with this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            TransferError::InsufficientFunds { .. } => FailureReason::InsufficientFunds,
            TransferError::Contention(..) => FailureReason::Contention,
            TransferError::CreditFailed(_) | TransferError::BalanceOverflow(_) => {
                FailureReason::CreditFailed
            }
            TransferError::Abandoned(_) => FailureReason::Abandoned,
            _ => FailureReason::StorageUnavailable,
        }
    }

    /// Rebuild the error a failed entry originally produced.
    pub(crate) fn replay(entry: &LedgerEntry, max_attempts: u32) -> Self {
        match entry.reason {
            Some(FailureReason::InsufficientFunds) => TransferError::InsufficientFunds {
                account: entry.sender.clone(),
                requested: entry.amount,
            },
            Some(FailureReason::Contention) => {
                TransferError::Contention(entry.sender.clone(), max_attempts)
            }
            Some(FailureReason::CreditFailed) => {
                TransferError::CreditFailed(entry.receiver.clone())
            }
            Some(FailureReason::Abandoned) => TransferError::Abandoned(entry.request_id.clone()),
            Some(FailureReason::StorageUnavailable) | None => TransferError::StorageUnavailable(
                format!("request {} failed on a storage error", entry.request_id),
            ),
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::StorageUnavailable(e.to_string())
    }
}

impl From<LedgerError> for TransferError {
    fn from(e: LedgerError) -> Self {
        TransferError::StorageUnavailable(e.to_string())
    }
}

//! Core domain types: accounts, transfer requests and ledger entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Amount;

/// Account identifier as printed on the passbook.
pub type AccountNumber = String;

/// Registered mobile number, used as a second factor when naming a receiver.
pub type MobileNumber = String;

/// Caller-supplied idempotency key for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh, time-sortable id for callers that did not supply one.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A customer account.
///
/// `balance` is only ever changed by the transfer engine; everything else is
/// fixed at signup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_number: AccountNumber,
    pub owner_name: String,
    pub branch: String,
    pub mobile_number: MobileNumber,
    pub pin_hash: String,
    pub balance: Amount,
}

/// A request to move money out of the (already authorized) sender's account.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub receiver_account_number: AccountNumber,
    pub receiver_mobile_number: MobileNumber,
    /// Raw caller value; validated by the engine.
    pub amount: i64,
    pub request_id: RequestId,
}

/// Lifecycle status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Committed,
    Failed,
    /// No entry recorded under the requested id.
    Unknown,
}

impl LedgerStatus {
    pub fn is_final(self) -> bool {
        matches!(self, LedgerStatus::Committed | LedgerStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Committed => "committed",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a pending transfer got. Tells the recovery sweep whether a refund is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Recorded, nothing moved yet.
    #[default]
    Begun,
    /// Sender debited, receiver not yet credited.
    Debited,
    /// Both legs applied, commit not yet recorded.
    Credited,
}

/// Why a transfer ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientFunds,
    Contention,
    CreditFailed,
    StorageUnavailable,
    /// Reconciled by the recovery sweep after the caller went away.
    Abandoned,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::InsufficientFunds => "insufficient_funds",
            FailureReason::Contention => "contention",
            FailureReason::CreditFailed => "credit_failed",
            FailureReason::StorageUnavailable => "storage_unavailable",
            FailureReason::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// One transfer attempt as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: RequestId,
    pub sender: AccountNumber,
    pub receiver: AccountNumber,
    pub amount: Amount,
    pub status: LedgerStatus,
    pub stage: Stage,
    pub reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create a new entry in the `Pending`/`Begun` state.
    pub fn begin(
        request_id: RequestId,
        sender: AccountNumber,
        receiver: AccountNumber,
        amount: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            sender,
            receiver,
            amount,
            status: LedgerStatus::Pending,
            stage: Stage::Begun,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this entry describes the same movement of money.
    pub fn same_transfer(&self, sender: &str, receiver: &str, amount: Amount) -> bool {
        self.sender == sender && self.receiver == receiver && self.amount == amount
    }

    /// Pending/Begun -> Pending/Debited. Returns the current status if the entry is final.
    pub fn mark_debited(&mut self) -> Result<(), LedgerStatus> {
        self.ensure_pending()?;
        self.stage = Stage::Debited;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pending/Debited -> Pending/Credited.
    pub fn mark_credited(&mut self) -> Result<(), LedgerStatus> {
        self.ensure_pending()?;
        self.stage = Stage::Credited;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pending -> Committed.
    pub fn commit(&mut self) -> Result<(), LedgerStatus> {
        self.ensure_pending()?;
        self.status = LedgerStatus::Committed;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pending -> Failed(reason).
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), LedgerStatus> {
        self.ensure_pending()?;
        self.status = LedgerStatus::Failed;
        self.reason = Some(reason);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), LedgerStatus> {
        if self.status == LedgerStatus::Pending {
            Ok(())
        } else {
            Err(self.status)
        }
    }
}

use serde::Serialize;

use crate::Amount;
use crate::model::{AccountNumber, RequestId};

/// Result of a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub request_id: RequestId,
    pub sender: AccountNumber,
    pub receiver: AccountNumber,
    pub amount: Amount,
    /// Balances as observed right after the transfer (or at replay time).
    pub sender_balance: Amount,
    pub receiver_balance: Amount,
    /// True when this receipt answers a retried request that had already committed.
    pub replayed: bool,
}

/// Outcome of one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale entries examined.
    pub examined: usize,
    /// Entries failed as abandoned with nothing to undo.
    pub abandoned: usize,
    /// Entries whose sender was refunded.
    pub refunded: usize,
    /// Entries credited before their caller went away, now committed.
    pub rolled_forward: usize,
    /// Entries left alone because their request is still running.
    pub in_flight: usize,
    /// Entries that could not be reconciled this round.
    pub errors: usize,
}

impl SweepReport {
    pub fn reconciled(&self) -> usize {
        self.abandoned + self.refunded + self.rolled_forward
    }
}

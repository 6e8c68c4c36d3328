//! Transfer engine.
//!
//! Moves money between two accounts without a transactional store. Each
//! balance change is an optimistic compare-and-swap retried a bounded number
//! of times, and every transfer is tracked by a ledger entry keyed by the
//! caller's request id.
//!
//! A ledger transition acts as a claim: whoever moves an entry out of
//! `Pending` (the request itself, or the recovery sweep) owns any refund that
//! follows. Debit always precedes credit. An entry recorded as `Debited` is
//! undone by refunding the sender; one recorded as `Credited` is finished by
//! committing it. The sweep never touches a request that is still running.

use std::sync::Arc;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::Amount;
use crate::ledger::{Ledger, LedgerError};
use crate::model::{
    AccountNumber, FailureReason, LedgerEntry, LedgerStatus, RequestId, Stage, TransferRequest,
};
use crate::store::{AccountStore, StoreError};

mod error;
pub use error::TransferError;

mod receipt;
pub use receipt::{Receipt, SweepReport};

mod recovery;
pub use recovery::{RecoveryConfig, RecoveryWorker};

/// Retry bounds for balance updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Compare-and-swap attempts per debit or credit before giving up with
    /// [`TransferError::Contention`].
    pub max_cas_attempts: u32,
    /// Attempts for corrective updates (refunds, reversed credits, commits).
    pub max_compensation_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: 5,
            max_compensation_attempts: 50,
        }
    }
}

/// The transfer engine.
///
/// Owns the only write path to balances. Store and ledger are injected.
pub struct Engine {
    store: Arc<dyn AccountStore>,
    ledger: Arc<dyn Ledger>,
    config: EngineConfig,
    /// Request ids currently being executed by this engine.
    in_flight: DashSet<RequestId>,
}

/// Holds a request id in the in-flight set until dropped.
struct InFlight<'a> {
    set: &'a DashSet<RequestId>,
    request_id: RequestId,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a DashSet<RequestId>, request_id: &RequestId) -> Option<Self> {
        set.insert(request_id.clone()).then(|| Self {
            set,
            request_id: request_id.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.request_id);
    }
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Debit(Amount),
    Credit(Amount),
}

impl Change {
    fn apply_to(self, account: &str, balance: Amount) -> Result<Amount, TransferError> {
        match self {
            Change::Debit(amount) => {
                balance
                    .checked_sub(amount)
                    .ok_or_else(|| TransferError::InsufficientFunds {
                        account: account.to_string(),
                        requested: amount,
                    })
            }
            Change::Credit(amount) => balance
                .checked_add(amount)
                .ok_or_else(|| TransferError::BalanceOverflow(account.to_string())),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Reconciled {
    Abandoned,
    Refunded,
    RolledForward,
    /// Its request is still running.
    InFlight,
    /// Finalized by someone else between listing and claiming.
    Skipped,
}

/// Public API
impl Engine {
    pub fn new(store: Arc<dyn AccountStore>, ledger: Arc<dyn Ledger>) -> Self {
        Self::with_config(store, ledger, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn AccountStore>,
        ledger: Arc<dyn Ledger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            in_flight: DashSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Move `request.amount` from `sender` to the named receiver.
    ///
    /// `sender` must already be authenticated and authorized; the engine does
    /// no credential checks. Retrying with the same request id returns the
    /// recorded outcome instead of moving money again.
    ///
    /// Drive the returned future to completion. Dropping it between the debit
    /// and the commit leaves the transfer to the recovery sweep.
    pub async fn transfer(
        &self,
        sender: &str,
        request: TransferRequest,
    ) -> Result<Receipt, TransferError> {
        let result = self.execute(sender, &request).await;
        Self::log_result(sender, &request, &result);
        result
    }

    /// Ledger status of a request.
    pub async fn status(&self, request_id: &RequestId) -> Result<LedgerStatus, TransferError> {
        Ok(self.ledger.status_of(request_id).await?)
    }

    /// Full ledger entry of a request, if any.
    pub async fn entry(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<LedgerEntry>, TransferError> {
        Ok(self.ledger.get(request_id).await?)
    }

    /// Reconcile up to `limit` pending entries untouched for `older_than`.
    ///
    /// Entries that never debited the sender are failed as abandoned,
    /// entries that only debited are failed and the sender is refunded, and
    /// entries that already credited the receiver are committed. Requests
    /// still running in this engine are skipped whatever their age.
    pub async fn sweep(
        &self,
        older_than: chrono::Duration,
        limit: usize,
    ) -> Result<SweepReport, TransferError> {
        let stale = self.ledger.stale(older_than).await?;
        let mut report = SweepReport::default();

        for entry in stale.into_iter().take(limit) {
            report.examined += 1;
            match self.reconcile(&entry).await {
                Ok(Reconciled::Abandoned) => report.abandoned += 1,
                Ok(Reconciled::Refunded) => report.refunded += 1,
                Ok(Reconciled::RolledForward) => report.rolled_forward += 1,
                Ok(Reconciled::InFlight) => report.in_flight += 1,
                Ok(Reconciled::Skipped) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(
                        request_id = %entry.request_id,
                        sender = %entry.sender,
                        amount = %entry.amount,
                        reason = %e,
                        "failed to reconcile stale transfer"
                    );
                }
            }
        }

        Ok(report)
    }
}

/// Private API
impl Engine {
    fn log_result(
        sender: &str,
        request: &TransferRequest,
        result: &Result<Receipt, TransferError>,
    ) {
        match result {
            Ok(receipt) if receipt.replayed => {
                info!(
                    request_id = %request.request_id,
                    sender,
                    receiver = %request.receiver_account_number,
                    amount = request.amount,
                    "transfer replayed"
                );
            }
            Ok(receipt) => {
                info!(
                    request_id = %request.request_id,
                    sender,
                    receiver = %request.receiver_account_number,
                    amount = %receipt.amount,
                    sender_balance = %receipt.sender_balance,
                    "transfer committed"
                );
            }
            Err(e @ (TransferError::StorageUnavailable(_) | TransferError::CreditFailed(_))) => {
                warn!(
                    request_id = %request.request_id,
                    sender,
                    receiver = %request.receiver_account_number,
                    amount = request.amount,
                    reason = %e,
                    "transfer failed"
                );
            }
            Err(e) => {
                info!(
                    request_id = %request.request_id,
                    sender,
                    receiver = %request.receiver_account_number,
                    amount = request.amount,
                    reason = %e,
                    "transfer rejected"
                );
            }
        }
    }

    /// Validate, record, debit, credit, commit. The in-flight guard is held
    /// from before the ledger entry exists until the request is done with it.
    async fn execute(
        &self,
        sender: &str,
        request: &TransferRequest,
    ) -> Result<Receipt, TransferError> {
        let amount =
            Amount::positive(request.amount).ok_or(TransferError::InvalidAmount(request.amount))?;
        let receiver = request.receiver_account_number.as_str();

        if sender == receiver {
            return Err(TransferError::SelfTransfer(sender.to_string()));
        }

        self.store
            .get(sender)
            .await
            .map_err(|e| not_found_as(e, TransferError::SenderNotFound))?;
        let receiver_account = self
            .store
            .get(receiver)
            .await
            .map_err(|e| not_found_as(e, TransferError::ReceiverNotFound))?;
        if receiver_account.mobile_number != request.receiver_mobile_number {
            return Err(TransferError::ReceiverMismatch(receiver.to_string()));
        }

        let id = &request.request_id;
        let Some(_in_flight) = InFlight::enter(&self.in_flight, id) else {
            return Err(TransferError::InProgress(id.clone()));
        };
        match self.ledger.begin(id, sender, receiver, amount).await {
            Ok(_) => {}
            Err(LedgerError::AlreadyExists(prior)) => {
                return self.replay(sender, receiver, amount, &prior).await;
            }
            Err(e) => return Err(e.into()),
        }

        // Debit
        let sender_balance = match self
            .apply(sender, Change::Debit(amount), self.config.max_cas_attempts)
            .await
        {
            Ok(balance) => balance,
            Err(err) => {
                self.record_failure(id, &err).await;
                return Err(err);
            }
        };

        if let Err(e) = self.ledger.mark_debited(id).await {
            // The entry is still Begun (or was swept as Begun), so nobody
            // else will refund this debit.
            let err = match e {
                LedgerError::AlreadyFinal { .. } => self.final_outcome(id).await,
                other => TransferError::from(other),
            };
            warn!(request_id = %id, reason = %err, "debit not recorded, refunding sender");
            let refunded = self.refund(id, sender, amount).await;
            // close the entry even when the refund failed
            self.record_failure(id, &err).await;
            refunded?;
            return Err(err);
        }

        // Credit
        let receiver_balance = match self
            .apply(receiver, Change::Credit(amount), self.config.max_cas_attempts)
            .await
        {
            Ok(balance) => balance,
            Err(err) => {
                warn!(
                    request_id = %id,
                    receiver,
                    reason = %err,
                    "credit failed, compensating sender"
                );
                let err = TransferError::CreditFailed(receiver.to_string());
                return Err(self.compensate(id, sender, amount, err).await);
            }
        };

        if let Err(e) = self.ledger.mark_credited(id).await {
            // the entry still reads Debited; take the credit back so that
            // refunding the sender is the right repair again
            if let Some(err) = self.unwind_credit(id, receiver, amount, e).await {
                return Err(self.compensate(id, sender, amount, err).await);
            }
        }

        // Commit. Past the credit the transfer only rolls forward.
        match self.commit_with_retry(id).await {
            Ok(())
            | Err(LedgerError::AlreadyFinal {
                status: LedgerStatus::Committed,
                ..
            }) => {}
            Err(LedgerError::AlreadyFinal { .. }) => return Err(self.final_outcome(id).await),
            Err(e) => {
                warn!(
                    request_id = %id,
                    reason = %e,
                    "commit not recorded, leaving transfer for recovery to complete"
                );
                return Err(TransferError::InProgress(id.clone()));
            }
        }

        Ok(Receipt {
            request_id: id.clone(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            amount,
            sender_balance,
            receiver_balance,
            replayed: false,
        })
    }

    /// Answer a retried request from its ledger entry.
    async fn replay(
        &self,
        sender: &str,
        receiver: &str,
        amount: Amount,
        prior: &LedgerEntry,
    ) -> Result<Receipt, TransferError> {
        if !prior.same_transfer(sender, receiver, amount) {
            return Err(TransferError::RequestIdReused(prior.request_id.clone()));
        }

        match prior.status {
            LedgerStatus::Committed => Ok(Receipt {
                request_id: prior.request_id.clone(),
                sender: prior.sender.clone(),
                receiver: prior.receiver.clone(),
                amount: prior.amount,
                sender_balance: self.store.get(sender).await?.balance,
                receiver_balance: self.store.get(receiver).await?.balance,
                replayed: true,
            }),
            LedgerStatus::Failed => {
                Err(TransferError::replay(prior, self.config.max_cas_attempts))
            }
            LedgerStatus::Pending | LedgerStatus::Unknown => {
                Err(TransferError::InProgress(prior.request_id.clone()))
            }
        }
    }

    /// One balance change as a bounded compare-and-swap loop.
    async fn apply(
        &self,
        account: &str,
        change: Change,
        attempts: u32,
    ) -> Result<Amount, TransferError> {
        for attempt in 1..=attempts {
            let current = self.store.get(account).await?.balance;
            let next = change.apply_to(account, current)?;

            match self
                .store
                .compare_and_swap_balance(account, current, next)
                .await
            {
                Ok(()) => return Ok(next),
                Err(StoreError::Conflict { actual, .. }) => {
                    debug!(
                        account,
                        attempt,
                        expected = %current,
                        actual = %actual,
                        "balance changed concurrently, retrying"
                    );
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TransferError::Contention(account.to_string(), attempts))
    }

    async fn refund(
        &self,
        id: &RequestId,
        sender: &str,
        amount: Amount,
    ) -> Result<Amount, TransferError> {
        self.apply(
            sender,
            Change::Credit(amount),
            self.config.max_compensation_attempts,
        )
        .await
        .inspect_err(|e| {
            error!(
                request_id = %id,
                sender,
                amount = %amount,
                reason = %e,
                "refund failed, manual reconciliation required"
            );
        })
    }

    /// A step after the debit failed. Claim the entry, then refund the
    /// sender. If the claim cannot be written the entry stays Pending/Debited
    /// and the recovery sweep refunds later.
    async fn compensate(
        &self,
        id: &RequestId,
        sender: &str,
        amount: Amount,
        err: TransferError,
    ) -> TransferError {
        match self.ledger.fail(id, err.failure_reason()).await {
            Ok(()) => match self.refund(id, sender, amount).await {
                Ok(_) => err,
                Err(e) => e,
            },
            // swept meanwhile; the sweep owns the refund
            Err(LedgerError::AlreadyFinal { .. }) => err,
            Err(e) => {
                warn!(
                    request_id = %id,
                    reason = %e,
                    "could not record transfer failure, leaving refund to recovery"
                );
                e.into()
            }
        }
    }

    async fn commit_with_retry(&self, id: &RequestId) -> Result<(), LedgerError> {
        let mut attempt = 1;
        loop {
            match self.ledger.commit(id).await {
                Ok(()) => return Ok(()),
                Err(e @ LedgerError::AlreadyFinal { .. }) => return Err(e),
                Err(e) if attempt >= self.config.max_compensation_attempts => return Err(e),
                Err(e) => {
                    debug!(request_id = %id, attempt, reason = %e, "commit failed, retrying");
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// The credit landed but could not be recorded. Reverse it and return
    /// the error to compensate with. If the reversal fails the credit stands
    /// and `None` tells the caller to go on and commit.
    async fn unwind_credit(
        &self,
        id: &RequestId,
        receiver: &str,
        amount: Amount,
        cause: LedgerError,
    ) -> Option<TransferError> {
        warn!(request_id = %id, reason = %cause, "credit not recorded, reversing credit");
        match self
            .apply(
                receiver,
                Change::Debit(amount),
                self.config.max_compensation_attempts,
            )
            .await
        {
            Ok(_) => Some(cause.into()),
            Err(e) => {
                error!(
                    request_id = %id,
                    receiver,
                    amount = %amount,
                    reason = %e,
                    "could not reverse credit, completing transfer instead"
                );
                None
            }
        }
    }

    /// Error describing an entry finalized by someone else.
    async fn final_outcome(&self, id: &RequestId) -> TransferError {
        match self.ledger.get(id).await {
            Ok(Some(entry)) => TransferError::replay(&entry, self.config.max_cas_attempts),
            Ok(None) => {
                TransferError::StorageUnavailable(format!("request {id} vanished from the ledger"))
            }
            Err(e) => e.into(),
        }
    }

    /// Best-effort `fail`; a lost write leaves the entry for the recovery sweep.
    async fn record_failure(&self, id: &RequestId, err: &TransferError) {
        match self.ledger.fail(id, err.failure_reason()).await {
            Ok(()) | Err(LedgerError::AlreadyFinal { .. }) => {}
            Err(e) => {
                warn!(request_id = %id, reason = %e, "could not record transfer failure");
            }
        }
    }

    async fn reconcile(&self, listed: &LedgerEntry) -> Result<Reconciled, TransferError> {
        let id = &listed.request_id;
        if self.in_flight.contains(id) {
            debug!(request_id = %id, "stale transfer still running, skipping");
            return Ok(Reconciled::InFlight);
        }

        // re-read: the stage may have advanced between listing and now. With
        // no request running for this id it cannot advance any further.
        let Some(entry) = self.ledger.get(id).await? else {
            return Err(LedgerError::NotFound(id.clone()).into());
        };
        if entry.status != LedgerStatus::Pending {
            return Ok(Reconciled::Skipped);
        }

        if entry.stage == Stage::Credited {
            return match self.ledger.commit(id).await {
                Ok(()) => {
                    info!(
                        request_id = %id,
                        sender = %entry.sender,
                        receiver = %entry.receiver,
                        amount = %entry.amount,
                        "stalled transfer committed"
                    );
                    Ok(Reconciled::RolledForward)
                }
                Err(LedgerError::AlreadyFinal { .. }) => Ok(Reconciled::Skipped),
                Err(e) => Err(e.into()),
            };
        }

        match self.ledger.fail(id, FailureReason::Abandoned).await {
            Ok(()) => {}
            Err(LedgerError::AlreadyFinal { .. }) => return Ok(Reconciled::Skipped),
            Err(e) => return Err(e.into()),
        }

        if entry.stage == Stage::Begun {
            info!(request_id = %id, "abandoned transfer failed, nothing to refund");
            return Ok(Reconciled::Abandoned);
        }

        let balance = self.refund(id, &entry.sender, entry.amount).await?;
        info!(
            request_id = %id,
            sender = %entry.sender,
            amount = %entry.amount,
            sender_balance = %balance,
            "abandoned transfer refunded"
        );
        Ok(Reconciled::Refunded)
    }
}

fn not_found_as(e: StoreError, variant: fn(AccountNumber) -> TransferError) -> TransferError {
    match e {
        StoreError::NotFound(account) => variant(account),
        other => other.into(),
    }
}

use std::path::Path;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};

use super::{Ledger, LedgerError};
use crate::Amount;
use crate::journal::Journal;
use crate::model::{FailureReason, LedgerEntry, LedgerStatus, RequestId};

/// Ledger keyed by request id, optionally backed by a CSV journal.
///
/// Every transition appends the full entry, so replaying the journal and
/// keeping the last row per request id rebuilds the current state.
pub struct TransferLog {
    entries: DashMap<RequestId, LedgerEntry>,
    journal: Option<Journal<LedgerEntry>>,
}

impl TransferLog {
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            journal: None,
        }
    }

    /// Open a durable ledger, replaying the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let (journal, rows) = Journal::<LedgerEntry>::open(path)?;
        let mut log = Self::in_memory();
        let replayed = rows.len();
        for entry in rows {
            log.entries.insert(entry.request_id.clone(), entry);
        }

        let pending = log
            .entries
            .iter()
            .filter(|e| e.status == LedgerStatus::Pending)
            .count();
        if pending > 0 {
            warn!(pending, "ledger has pending transfers awaiting recovery");
        }
        info!(
            path = %journal.path().display(),
            rows = replayed,
            entries = log.entries.len(),
            "ledger restored"
        );
        log.journal = Some(journal);
        Ok(log)
    }

    fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        if let Some(journal) = &self.journal {
            journal.append(entry)?;
        }
        Ok(())
    }

    /// Apply `step` to a pending entry and persist the result. The entry is
    /// left unchanged if the step is refused or the write fails.
    fn transition(
        &self,
        request_id: &RequestId,
        step: impl FnOnce(&mut LedgerEntry) -> Result<(), LedgerStatus>,
    ) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(request_id)
            .ok_or_else(|| LedgerError::NotFound(request_id.clone()))?;

        let mut next = entry.clone();
        step(&mut next).map_err(|status| LedgerError::AlreadyFinal {
            request_id: request_id.clone(),
            status,
        })?;
        self.record(&next)?;
        *entry = next;
        Ok(())
    }
}

impl Default for TransferLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl Ledger for TransferLog {
    async fn begin(
        &self,
        request_id: &RequestId,
        sender: &str,
        receiver: &str,
        amount: Amount,
    ) -> Result<LedgerEntry, LedgerError> {
        match self.entries.entry(request_id.clone()) {
            Entry::Occupied(existing) => {
                Err(LedgerError::AlreadyExists(Box::new(existing.get().clone())))
            }
            Entry::Vacant(slot) => {
                let entry = LedgerEntry::begin(
                    request_id.clone(),
                    sender.to_string(),
                    receiver.to_string(),
                    amount,
                );
                self.record(&entry)?;
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    async fn mark_debited(&self, request_id: &RequestId) -> Result<(), LedgerError> {
        self.transition(request_id, LedgerEntry::mark_debited)
    }

    async fn mark_credited(&self, request_id: &RequestId) -> Result<(), LedgerError> {
        self.transition(request_id, LedgerEntry::mark_credited)
    }

    async fn commit(&self, request_id: &RequestId) -> Result<(), LedgerError> {
        self.transition(request_id, LedgerEntry::commit)
    }

    async fn fail(
        &self,
        request_id: &RequestId,
        reason: FailureReason,
    ) -> Result<(), LedgerError> {
        self.transition(request_id, |entry| entry.fail(reason))
    }

    async fn get(&self, request_id: &RequestId) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.entries.get(request_id).map(|e| e.value().clone()))
    }

    async fn stale(&self, older_than: Duration) -> Result<Vec<LedgerEntry>, LedgerError> {
        // a threshold reaching before the earliest representable time
        // matches nothing
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            return Ok(Vec::new());
        };
        let mut stale: Vec<LedgerEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == LedgerStatus::Pending && e.updated_at <= cutoff)
            .map(|e| e.value().clone())
            .collect();
        stale.sort_by_key(|e| e.updated_at);
        Ok(stale)
    }
}

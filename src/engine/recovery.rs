//! Background reconciliation of abandoned transfers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info};

use super::{Engine, SweepReport, TransferError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Seconds between sweeps.
    pub scan_interval_secs: u64,
    /// Seconds a pending entry must sit untouched before it is reconciled.
    pub stale_threshold_secs: u64,
    /// Maximum entries reconciled per sweep.
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    /// Thresholds beyond what `chrono` can represent saturate, which makes
    /// the sweep a no-op.
    pub fn stale_threshold(&self) -> chrono::Duration {
        i64::try_from(self.stale_threshold_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Periodically fails or refunds transfers whose caller went away.
pub struct RecoveryWorker {
    engine: Arc<Engine>,
    config: RecoveryConfig,
}

impl RecoveryWorker {
    pub fn new(engine: Arc<Engine>, config: RecoveryConfig) -> Self {
        Self { engine, config }
    }

    /// Sweep forever at the configured interval.
    pub async fn run(self) {
        info!(
            scan_interval_secs = self.config.scan_interval_secs,
            stale_threshold_secs = self.config.stale_threshold_secs,
            "starting recovery worker"
        );

        let mut interval = tokio::time::interval(self.config.scan_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(interval);

        while ticks.next().await.is_some() {
            // a failed scan is retried on the next tick
            if let Err(e) = self.scan_once().await {
                error!(reason = %e, "recovery scan failed");
            }
        }
    }

    /// Run a single sweep.
    pub async fn scan_once(&self) -> Result<SweepReport, TransferError> {
        let report = self
            .engine
            .sweep(self.config.stale_threshold(), self.config.batch_size)
            .await?;

        if report.examined == 0 {
            debug!("no stale transfers");
        } else {
            info!(
                examined = report.examined,
                abandoned = report.abandoned,
                refunded = report.refunded,
                rolled_forward = report.rolled_forward,
                in_flight = report.in_flight,
                errors = report.errors,
                "recovery sweep finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::ledger::{Ledger, TransferLog};
    use crate::model::{Account, LedgerStatus, RequestId};
    use crate::store::{AccountStore, Accounts};

    #[test]
    fn config_defaults() {
        let config = RecoveryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.stale_threshold(), chrono::Duration::seconds(60));
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config = RecoveryConfig {
            scan_interval_secs: 0,
            ..RecoveryConfig::default()
        };
        assert_eq!(config.scan_interval(), Duration::from_secs(1));
    }

    #[test]
    fn huge_threshold_saturates() {
        for secs in [u64::MAX, i64::MAX as u64, i64::MAX as u64 / 1000 + 1] {
            let config = RecoveryConfig {
                stale_threshold_secs: secs,
                ..RecoveryConfig::default()
            };
            assert_eq!(config.stale_threshold(), chrono::Duration::MAX);
        }
    }

    #[tokio::test]
    async fn huge_threshold_sweeps_nothing() {
        let ledger = Arc::new(TransferLog::in_memory());
        ledger
            .begin(&RequestId::from("r1"), "A1", "B2", Amount::new(10))
            .await
            .unwrap();
        let engine = Arc::new(Engine::new(Arc::new(Accounts::in_memory()), ledger.clone()));
        let worker = RecoveryWorker::new(
            engine,
            RecoveryConfig {
                stale_threshold_secs: u64::MAX,
                ..RecoveryConfig::default()
            },
        );

        let report = worker.scan_once().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(
            ledger.status_of(&RequestId::from("r1")).await.unwrap(),
            LedgerStatus::Pending
        );
    }

    #[tokio::test]
    async fn scan_once_reconciles_stale_entries() {
        let store = Arc::new(Accounts::in_memory());
        let ledger = Arc::new(TransferLog::in_memory());
        store
            .insert(Account {
                account_number: "A1".into(),
                owner_name: "alice".into(),
                branch: "Main".into(),
                mobile_number: "9000".into(),
                pin_hash: String::new(),
                balance: Amount::new(100),
            })
            .await
            .unwrap();

        // a caller that recorded a transfer and vanished
        let id = RequestId::from("ghost");
        ledger.begin(&id, "A1", "B2", Amount::new(10)).await.unwrap();

        let engine = Arc::new(Engine::new(store, ledger.clone()));
        let worker = RecoveryWorker::new(
            engine,
            RecoveryConfig {
                stale_threshold_secs: 0,
                ..RecoveryConfig::default()
            },
        );

        let report = worker.scan_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.abandoned, 1);
        assert_eq!(ledger.status_of(&id).await.unwrap(), LedgerStatus::Failed);

        let report = worker.scan_once().await.unwrap();
        assert_eq!(report.examined, 0);
    }
}

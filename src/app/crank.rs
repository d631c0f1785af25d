//! Stale transaction crank.
//!
//! Polls for PENDING transactions that have sat longer than a configured
//! window. Covers jobs lost with a crashed process and payments whose result was
//! never persisted: those are resolved against the ledger by memo.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::service::SettlementService;

/// Crank configuration
#[derive(Debug, Clone)]
pub struct CrankConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    /// A PENDING transaction older than this is considered stale.
    /// Keep it above the ledger submission timeout.
    pub stale_after_secs: i64,
    pub batch_size: i64,
}

impl Default for CrankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(60),
            stale_after_secs: 120,
            batch_size: 20,
        }
    }
}

/// Periodic reconciliation of stale PENDING transactions
pub struct StaleTransactionCrank {
    service: Arc<SettlementService>,
    config: CrankConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl StaleTransactionCrank {
    #[must_use]
    pub fn new(
        service: Arc<SettlementService>,
        config: CrankConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        if !self.config.enabled {
            info!("Stale transaction crank disabled");
            return;
        }
        info!(
            poll_interval = ?self.config.poll_interval,
            stale_after_secs = self.config.stale_after_secs,
            "Stale transaction crank started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_once().await,
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Stale transaction crank shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconciliation pass
    pub async fn run_once(&self) {
        let stale_after = chrono::Duration::seconds(self.config.stale_after_secs);
        match self
            .service
            .reconcile_stale_transactions(stale_after, self.config.batch_size)
            .await
        {
            Ok(0) => {}
            Ok(count) => info!(count = count, "Reconciled stale transactions"),
            Err(e) => warn!(error = %e, "Stale transaction scan failed"),
        }
    }
}

/// Spawn the crank; send `true` on the returned channel to stop it
pub fn spawn_crank(
    service: Arc<SettlementService>,
    config: CrankConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let crank = StaleTransactionCrank::new(service, config, shutdown_rx);
    let handle = tokio::spawn(crank.run());
    (handle, shutdown_tx)
}

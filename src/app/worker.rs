//! Background settlement worker.
//!
//! Consumes jobs from the [`SettlementQueue`](super::queue::SettlementQueue)
//! with bounded concurrency and periodically scans persistence for due retries
//! whose in-memory timer was lost (process restart). The scan only queues
//! those retries; they run alongside every other job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::SettlementJob;
use super::service::SettlementService;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Jobs processed at the same time
    pub max_concurrent_jobs: usize,
    /// Interval between scans for due retries
    pub retry_scan_interval: Duration,
    /// Due retries picked up per scan
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_jobs: 8,
            retry_scan_interval: Duration::from_secs(30),
            batch_size: 50,
        }
    }
}

/// Consumes settlement jobs until shutdown
pub struct SettlementWorker {
    service: Arc<SettlementService>,
    config: WorkerConfig,
    jobs: mpsc::UnboundedReceiver<SettlementJob>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SettlementWorker {
    #[must_use]
    pub fn new(
        service: Arc<SettlementService>,
        config: WorkerConfig,
        jobs: mpsc::UnboundedReceiver<SettlementJob>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            config,
            jobs,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        if !self.config.enabled {
            info!("Settlement worker disabled");
            return;
        }

        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            retry_scan_interval = ?self.config.retry_scan_interval,
            "Settlement worker started"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let mut scan = tokio::time::interval(self.config.retry_scan_interval);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Settlement worker shutting down");
                        break;
                    }
                }
                job = self.jobs.recv() => {
                    let Some(job) = job else {
                        info!("Settlement queue closed, worker stopping");
                        break;
                    };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        Self::handle(&service, job).await;
                        drop(permit);
                    });
                }
                _ = scan.tick() => {
                    match self.service.dispatch_due_retries(self.config.batch_size).await {
                        Ok(0) => {}
                        Ok(count) => info!(count = count, "Queued due retries"),
                        Err(e) => warn!(error = %e, "Due retry scan failed"),
                    }
                }
            }
        }
    }

    async fn handle(service: &SettlementService, job: SettlementJob) {
        match service.process_job(&job).await {
            Ok(tx) => debug!(id = %tx.id, status = %tx.status, "Settlement job done"),
            Err(e) if e.is_concurrent_modification() => {
                debug!(id = %job.id(), "Settlement job lost race to another attempt");
            }
            Err(e) => warn!(id = %job.id(), error = %e, "Settlement job failed"),
        }
    }
}

/// Spawn the worker; send `true` on the returned channel to stop it
pub fn spawn_worker(
    service: Arc<SettlementService>,
    jobs: mpsc::UnboundedReceiver<SettlementJob>,
    config: WorkerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = SettlementWorker::new(service, config, jobs, shutdown_rx);
    let handle = tokio::spawn(worker.run());
    (handle, shutdown_tx)
}

//! Settlement job channel and time-driven retry queue.
//!
//! Jobs are transaction ids handed to the background worker. A scheduled retry
//! is a sleeping task keyed by transaction id; it only dispatches if its entry
//! is still in the registry when it wakes. Cancelling removes the entry and
//! aborts the task; a cancel after the retry fired finds nothing to remove.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Work item consumed by the settlement worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementJob {
    /// Submit a PENDING transaction to the ledger
    Submit { id: String },
    /// Move a FAILED transaction whose backoff elapsed back to PENDING and submit it
    Retry { id: String },
}

impl SettlementJob {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Submit { id } | Self::Retry { id } => id,
        }
    }
}

struct ScheduledRetry {
    generation: u64,
    /// Filled in right after the timer task is spawned
    timer: Option<AbortHandle>,
}

impl ScheduledRetry {
    fn abort(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// Dispatches settlement jobs and tracks scheduled retries
pub struct SettlementQueue {
    sender: mpsc::UnboundedSender<SettlementJob>,
    scheduled: Arc<DashMap<String, ScheduledRetry>>,
    generation: AtomicU64,
}

impl SettlementQueue {
    /// Create a queue and the receiving end the worker consumes
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SettlementJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            sender,
            scheduled: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        };
        (queue, receiver)
    }

    /// Hand a job to the worker. Returns false when no worker is listening.
    pub fn dispatch(&self, job: SettlementJob) -> bool {
        match self.sender.send(job) {
            Ok(()) => true,
            Err(mpsc::error::SendError(job)) => {
                warn!(id = %job.id(), "Settlement worker is not running, job dropped");
                false
            }
        }
    }

    /// Dispatch a retry job for `id` after `delay`.
    ///
    /// Scheduling again for the same id replaces the earlier timer. Must be called
    /// from within a Tokio runtime.
    pub fn schedule_retry(&self, id: &str, delay: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let entry = ScheduledRetry {
            generation,
            timer: None,
        };
        if let Some(replaced) = self.scheduled.insert(id.to_string(), entry) {
            replaced.abort();
        }

        let scheduled = Arc::clone(&self.scheduled);
        let sender = self.sender.clone();
        let task_id = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = scheduled
                .remove_if(&task_id, |_, current| current.generation == generation)
                .is_some();
            if !fired {
                debug!(id = %task_id, "Scheduled retry was cancelled or replaced");
                return;
            }
            if sender.send(SettlementJob::Retry { id: task_id.clone() }).is_err() {
                warn!(id = %task_id, "Settlement worker is not running, retry dropped");
            }
        });

        // The task may already have fired (zero delay) or been replaced
        match self.scheduled.get_mut(id) {
            Some(mut entry) if entry.generation == generation => {
                entry.timer = Some(task.abort_handle());
            }
            _ => {}
        }
    }

    /// Remove a scheduled retry before it fires. Returns false if none was pending.
    pub fn cancel_retry(&self, id: &str) -> bool {
        match self.scheduled.remove(id) {
            Some((_, entry)) => {
                entry.abort();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_retry_scheduled(&self, id: &str) -> bool {
        self.scheduled.contains_key(id)
    }

    #[must_use]
    pub fn scheduled_retries(&self) -> usize {
        self.scheduled.len()
    }
}

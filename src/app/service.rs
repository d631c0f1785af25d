//! Settlement coordinator.
//!
//! Drives fee transactions from creation to a terminal state. Every state change
//! is persisted through a compare-and-swap on the record version before control
//! returns, and no lock is held while the ledger call is in flight.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AppError, ConfigProvider, DatabaseClient, DatabaseError, FailureOutcome, FeeQuote,
    FeeQuoteRequest, FeeSchedule, FeeStatus, FeeTransaction, HealthResponse, HealthStatus,
    InitiateSettlementRequest, LedgerClient, LedgerError, LedgerReceipt, PaginatedResponse,
    RefundOutcome, SettlementError, SettlementPayment, SettlementSettings, ValidationError,
};

use super::queue::{SettlementJob, SettlementQueue};

/// Attempts at persisting a ledger result before giving up on a contended record
const MAX_APPLY_ATTEMPTS: usize = 3;

/// What a stale-transaction pass did with one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Never submitted; submitted now
    Submitted,
    /// Submitted before and found on the ledger
    Collected,
    /// FAILED after an unchecked submission that the ledger confirms never landed
    NotLanded,
    /// Submitted before, absent from the ledger, submitted again
    Resubmitted,
    /// Submitted before and the ledger cannot be searched; left PENDING
    Unresolved,
    /// A submission is still within its timeout
    InFlight,
    /// No longer PENDING
    Skipped,
}

/// Application service containing the settlement logic
pub struct SettlementService {
    db_client: Arc<dyn DatabaseClient>,
    ledger_client: Arc<dyn LedgerClient>,
    config: Arc<dyn ConfigProvider>,
    queue: Arc<SettlementQueue>,
}

impl SettlementService {
    #[must_use]
    pub fn new(
        db_client: Arc<dyn DatabaseClient>,
        ledger_client: Arc<dyn LedgerClient>,
        config: Arc<dyn ConfigProvider>,
        queue: Arc<SettlementQueue>,
    ) -> Self {
        Self {
            db_client,
            ledger_client,
            config,
            queue,
        }
    }

    #[must_use]
    pub fn settings(&self) -> Arc<SettlementSettings> {
        self.config.settings()
    }

    #[must_use]
    pub fn queue(&self) -> &SettlementQueue {
        &self.queue
    }

    /// Compute a fee quote without side effects
    #[instrument(skip(self, request), fields(user_id = %request.user.user_id))]
    pub async fn compute_fee_quote(&self, request: &FeeQuoteRequest) -> Result<FeeQuote, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;
        let settings = self.config.settings();
        let quote = settings
            .fee_schedule
            .quote(request.trade_amount, &request.user, Utc::now())?;
        debug!(tier = %quote.fee_tier, rate = %quote.fee_rate, fee = %quote.fee_amount, "Fee quoted");
        Ok(quote)
    }

    /// Compute the fee for a trade, persist it as PENDING and hand it to the worker.
    ///
    /// Returns the existing transaction when the trade was already settled.
    #[instrument(skip(self, request), fields(user_id = %request.user.user_id, trade_id = ?request.trade_id))]
    pub async fn initiate_settlement(
        &self,
        request: &InitiateSettlementRequest,
    ) -> Result<FeeTransaction, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;
        let asset = request.asset();
        asset
            .check()
            .map_err(|message| ValidationError::InvalidField {
                field: "asset_code".to_string(),
                message,
            })?;

        if let Some(trade_id) = request.trade_id.as_deref()
            && let Some(existing) = self
                .db_client
                .get_fee_transaction_by_trade_id(trade_id)
                .await?
        {
            info!(id = %existing.id, "Settlement already initiated for trade");
            return Ok(existing);
        }

        let settings = self.config.settings();
        let destination = request
            .destination_address
            .clone()
            .or_else(|| settings.platform_wallet.clone())
            .ok_or_else(|| ValidationError::MissingField("destination_address".to_string()))?;
        let quote = settings
            .fee_schedule
            .quote(request.trade_amount, &request.user, Utc::now())?;

        let tx = FeeTransaction::new(
            &quote,
            &request.user,
            request.trade_id.clone(),
            asset,
            Some(destination),
        );

        let stored = match self.db_client.insert_fee_transaction(&tx).await {
            Ok(stored) => stored,
            Err(AppError::Database(DatabaseError::Duplicate(reason))) => {
                // Lost an insert race for the same trade id
                let existing = match request.trade_id.as_deref() {
                    Some(trade_id) => {
                        self.db_client
                            .get_fee_transaction_by_trade_id(trade_id)
                            .await?
                    }
                    None => None,
                };
                return existing.ok_or(AppError::Database(DatabaseError::Duplicate(reason)));
            }
            Err(e) => return Err(e),
        };

        info!(
            id = %stored.id,
            tier = %stored.fee_tier,
            fee = %stored.fee_amount,
            "Fee transaction created"
        );
        self.queue.dispatch(SettlementJob::Submit {
            id: stored.id.clone(),
        });
        Ok(stored)
    }

    /// Get a transaction by ID
    #[instrument(skip(self))]
    pub async fn get_transaction(&self, id: &str) -> Result<FeeTransaction, AppError> {
        self.db_client
            .get_fee_transaction(id)
            .await?
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(format!("fee transaction {id}"))))
    }

    /// List transactions with pagination
    #[instrument(skip(self))]
    pub async fn list_transactions(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<FeeTransaction>, AppError> {
        self.db_client.list_fee_transactions(limit, cursor).await
    }

    /// Reverse a collected fee. Repeating the request returns the refunded record unchanged.
    #[instrument(skip(self))]
    pub async fn request_refund(&self, id: &str) -> Result<FeeTransaction, AppError> {
        let mut tx = self.get_transaction(id).await?;
        match tx.refund(Utc::now())? {
            RefundOutcome::AlreadyRefunded => {
                debug!("Transaction already refunded");
                Ok(tx)
            }
            RefundOutcome::Refunded => {
                let stored = self.persist(&tx).await?;
                info!(fee = %stored.fee_amount, "Fee refunded");
                Ok(stored)
            }
        }
    }

    /// Operator retry of a FAILED transaction, bypassing any scheduled backoff
    #[instrument(skip(self))]
    pub async fn retry_settlement(&self, id: &str) -> Result<FeeTransaction, AppError> {
        let settings = self.config.settings();
        let mut tx = self.get_transaction(id).await?;
        tx.begin_retry(&settings.retry, Utc::now())?;
        let stored = self.persist(&tx).await?;

        self.queue.cancel_retry(id);
        info!(retry_count = stored.retry_count, "Manual retry requested");
        self.queue.dispatch(SettlementJob::Submit {
            id: stored.id.clone(),
        });
        Ok(stored)
    }

    /// Cancel the automatic retry of a FAILED transaction; a no-op once it has fired
    #[instrument(skip(self))]
    pub async fn cancel_scheduled_retry(&self, id: &str) -> Result<FeeTransaction, AppError> {
        let removed = self.queue.cancel_retry(id);
        let mut tx = self.get_transaction(id).await?;
        if tx.clear_scheduled_retry(Utc::now()) {
            let stored = self.persist(&tx).await?;
            info!(removed_timer = removed, "Scheduled retry cancelled");
            return Ok(stored);
        }
        debug!(status = %tx.status, "No scheduled retry to cancel");
        Ok(tx)
    }

    /// Execute a job from the settlement queue
    pub async fn process_job(&self, job: &SettlementJob) -> Result<FeeTransaction, AppError> {
        match job {
            SettlementJob::Submit { id } => self.settle(id).await,
            SettlementJob::Retry { id } => self.resume_retry(id).await,
        }
    }

    /// Submit a PENDING transaction nobody has claimed yet
    #[instrument(skip(self))]
    pub async fn settle(&self, id: &str) -> Result<FeeTransaction, AppError> {
        let tx = self.get_transaction(id).await?;
        if tx.status != FeeStatus::Pending {
            debug!(status = %tx.status, "Transaction is not pending");
            return Ok(tx);
        }
        if tx.last_attempt_at.is_some() {
            debug!("Submission already claimed");
            return Ok(tx);
        }
        let settings = self.config.settings();
        self.attempt(tx, &settings).await
    }

    /// Move a FAILED transaction whose backoff elapsed back to PENDING and submit it
    #[instrument(skip(self))]
    pub async fn resume_retry(&self, id: &str) -> Result<FeeTransaction, AppError> {
        let settings = self.config.settings();
        let mut tx = self.get_transaction(id).await?;
        let now = Utc::now();
        let due = tx.status == FeeStatus::Failed && tx.next_retry_at.is_some_and(|at| at <= now);
        if !due {
            debug!(status = %tx.status, "Retry no longer due");
            return Ok(tx);
        }
        tx.begin_retry(&settings.retry, now)?;
        let tx = self.persist(&tx).await?;
        info!(retry_count = tx.retry_count, "Retrying settlement");
        self.attempt(tx, &settings).await
    }

    /// Queue a retry job for every due FAILED transaction without a timer in
    /// this process; the worker runs them
    #[instrument(skip(self))]
    pub async fn dispatch_due_retries(&self, batch_size: i64) -> Result<usize, AppError> {
        let due = self
            .db_client
            .find_due_retries(Utc::now(), batch_size)
            .await?;
        let mut dispatched = 0;
        for tx in due {
            if self.queue.is_retry_scheduled(&tx.id) {
                continue;
            }
            if self.queue.dispatch(SettlementJob::Retry { id: tx.id }) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Resolve PENDING transactions created before `stale_after` ago, and FAILED
    /// ones whose last submission, started before then, was never checked
    /// against the ledger
    #[instrument(skip(self))]
    pub async fn reconcile_stale_transactions(
        &self,
        stale_after: chrono::Duration,
        batch_size: i64,
    ) -> Result<usize, AppError> {
        let cutoff = Utc::now() - stale_after;
        let stale = self
            .db_client
            .find_by_status(FeeStatus::Pending, cutoff, batch_size)
            .await?;
        let unchecked = self
            .db_client
            .find_unchecked_failures(cutoff, batch_size)
            .await?;
        let mut resolved = 0;
        for tx in stale.into_iter().chain(unchecked) {
            let id = tx.id.clone();
            let outcome = if tx.status == FeeStatus::Failed {
                self.reconcile_failure(tx).await
            } else {
                self.reconcile(tx).await
            };
            match outcome {
                Ok(ReconcileOutcome::InFlight | ReconcileOutcome::Skipped) => {}
                Ok(ReconcileOutcome::Unresolved) => {
                    warn!(id = %id, "Stale transaction needs manual reconciliation");
                }
                Ok(outcome) => {
                    debug!(id = %id, ?outcome, "Stale transaction reconciled");
                    resolved += 1;
                }
                Err(e) if e.is_concurrent_modification() => {
                    debug!(id = %id, "Stale transaction picked up elsewhere");
                }
                Err(e) => warn!(id = %id, error = %e, "Failed to reconcile stale transaction"),
            }
        }
        Ok(resolved)
    }

    /// Decide what to do with one PENDING transaction found by the stale scan
    #[instrument(skip(self, tx), fields(id = %tx.id))]
    pub async fn reconcile(&self, tx: FeeTransaction) -> Result<ReconcileOutcome, AppError> {
        if tx.status != FeeStatus::Pending {
            return Ok(ReconcileOutcome::Skipped);
        }
        let settings = self.config.settings();
        let Some(attempted_at) = tx.last_attempt_at else {
            self.attempt(tx, &settings).await?;
            return Ok(ReconcileOutcome::Submitted);
        };

        let timeout = chrono::Duration::from_std(settings.submission_timeout())
            .unwrap_or(chrono::Duration::MAX);
        if Utc::now() - attempted_at < timeout {
            return Ok(ReconcileOutcome::InFlight);
        }

        match self.ledger_client.find_payment_by_memo(&tx.settlement_memo()).await {
            Ok(Some(receipt)) => {
                info!(tx_hash = %receipt.tx_hash, "Payment found on ledger");
                self.apply_result(tx, Ok(receipt), &settings).await?;
                Ok(ReconcileOutcome::Collected)
            }
            Ok(None) => {
                info!("Payment absent from ledger, resubmitting");
                self.submit(tx, &settings).await?;
                Ok(ReconcileOutcome::Resubmitted)
            }
            Err(AppError::NotSupported(_)) => Ok(ReconcileOutcome::Unresolved),
            Err(e) => Err(e),
        }
    }

    /// Look up the last submission of a FAILED transaction that ended without a
    /// definite answer (timeout, lost connection, unreadable response)
    #[instrument(skip(self, tx), fields(id = %tx.id))]
    pub async fn reconcile_failure(
        &self,
        mut tx: FeeTransaction,
    ) -> Result<ReconcileOutcome, AppError> {
        if !tx.awaiting_ledger_check() {
            return Ok(ReconcileOutcome::Skipped);
        }
        let now = Utc::now();
        match self.ledger_client.find_payment_by_memo(&tx.settlement_memo()).await {
            Ok(Some(receipt)) => {
                tx.reconcile_landed(receipt.tx_hash.clone(), now)?;
                let stored = self.persist(&tx).await?;
                warn!(
                    tx_hash = %receipt.tx_hash,
                    retry_count = stored.retry_count,
                    "Failed transaction found on ledger, marked collected"
                );
                Ok(ReconcileOutcome::Collected)
            }
            Ok(None) => {
                tx.confirm_not_landed(now);
                self.persist(&tx).await?;
                debug!("No ledger payment for failed transaction");
                Ok(ReconcileOutcome::NotLanded)
            }
            Err(AppError::NotSupported(_)) => Ok(ReconcileOutcome::Unresolved),
            Err(e) => Err(e),
        }
    }

    /// Get fee schedule currently in effect
    #[must_use]
    pub fn fee_schedule(&self) -> FeeSchedule {
        self.config.settings().fee_schedule.clone()
    }

    /// Replace the fee schedule for subsequent computations
    #[instrument(skip(self, schedule), fields(promotions = schedule.promotions.len()))]
    pub fn replace_fee_schedule(&self, schedule: FeeSchedule) -> Result<(), AppError> {
        schedule
            .check()
            .map_err(|e| ValidationError::Multiple(e.to_string()))?;
        self.config.replace_fee_schedule(schedule)?;
        info!("Fee schedule replaced");
        Ok(())
    }

    /// Check health of all dependencies
    pub async fn health_check(&self) -> HealthResponse {
        let db_health = match self.db_client.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let ledger_health = match self.ledger_client.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(db_health, ledger_health)
    }

    async fn persist(&self, tx: &FeeTransaction) -> Result<FeeTransaction, AppError> {
        self.db_client.update_fee_transaction(tx).await.inspect_err(|e| {
            if e.is_concurrent_modification() {
                warn!(id = %tx.id, version = tx.version, "Lost update race");
            }
        })
    }

    /// Submit an unclaimed PENDING transaction, first checking the ledger when an
    /// earlier attempt may have landed
    async fn attempt(
        &self,
        tx: FeeTransaction,
        settings: &SettlementSettings,
    ) -> Result<FeeTransaction, AppError> {
        if tx.may_have_landed() {
            match self.ledger_client.find_payment_by_memo(&tx.settlement_memo()).await {
                Ok(Some(receipt)) => {
                    info!(id = %tx.id, tx_hash = %receipt.tx_hash, "Earlier attempt landed on ledger");
                    return self.apply_result(tx, Ok(receipt), settings).await;
                }
                Ok(None) | Err(AppError::NotSupported(_)) => {}
                Err(e) => {
                    warn!(id = %tx.id, error = %e, "Ledger lookup failed, leaving transaction pending");
                    return Err(e);
                }
            }
        }
        self.submit(tx, settings).await
    }

    /// Claim the transaction, call the ledger and persist the outcome
    async fn submit(
        &self,
        mut tx: FeeTransaction,
        settings: &SettlementSettings,
    ) -> Result<FeeTransaction, AppError> {
        let now = Utc::now();
        if tx.fee_amount.is_zero() {
            tx.mark_waived(now)?;
            let stored = self.persist(&tx).await?;
            info!(id = %stored.id, "Zero fee collected without ledger payment");
            return Ok(stored);
        }

        tx.mark_attempted(now)?;
        let claimed = self.persist(&tx).await?;

        let result = match claimed.destination_address.clone() {
            Some(destination) => {
                let payment = SettlementPayment {
                    amount: claimed.fee_amount,
                    asset: claimed.asset.clone(),
                    destination,
                    memo: claimed.settlement_memo(),
                };
                debug!(id = %claimed.id, amount = %payment.amount, "Submitting payment to ledger");
                match tokio::time::timeout(
                    settings.submission_timeout(),
                    self.ledger_client.submit(&payment),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LedgerError::Timeout(format!(
                        "no ledger response within {} ms",
                        settings.submission_timeout_ms
                    ))),
                }
            }
            None => Err(LedgerError::SubmissionFailed {
                retryable: false,
                reason: "no settlement destination".to_string(),
            }),
        };

        self.apply_result(claimed, result, settings).await
    }

    /// Persist the ledger result, re-reading the record when it changed underneath
    async fn apply_result(
        &self,
        mut current: FeeTransaction,
        result: Result<LedgerReceipt, LedgerError>,
        settings: &SettlementSettings,
    ) -> Result<FeeTransaction, AppError> {
        let id = current.id.clone();
        for _ in 0..MAX_APPLY_ATTEMPTS {
            if current.status != FeeStatus::Pending {
                warn!(id = %id, status = %current.status, "Transaction changed during submission, result not applied");
                return Ok(current);
            }

            let mut next = current.clone();
            let now = Utc::now();
            let outcome = match &result {
                Ok(receipt) => {
                    next.mark_collected(receipt.tx_hash.clone(), now)?;
                    None
                }
                Err(e) => Some(next.mark_failed(e.to_string(), e.is_retryable(), &settings.retry, now)?),
            };

            match self.db_client.update_fee_transaction(&next).await {
                Ok(stored) => {
                    self.after_transition(&stored, outcome, settings);
                    return Ok(stored);
                }
                Err(e) if e.is_concurrent_modification() => {
                    warn!(id = %id, "Concurrent update while applying ledger result, re-reading");
                    current = self.get_transaction(&id).await?;
                }
                Err(e) => {
                    if let Ok(receipt) = &result {
                        error!(
                            id = %id,
                            tx_hash = %receipt.tx_hash,
                            error = %e,
                            "Ledger accepted the payment but the state update failed; transaction stays PENDING until reconciled"
                        );
                    }
                    return Err(e);
                }
            }
        }
        Err(SettlementError::ConcurrentModification(id).into())
    }

    fn after_transition(
        &self,
        stored: &FeeTransaction,
        outcome: Option<FailureOutcome>,
        settings: &SettlementSettings,
    ) {
        match outcome {
            None => info!(
                id = %stored.id,
                tx_hash = ?stored.ledger_tx_hash,
                retry_count = stored.retry_count,
                "Fee collected"
            ),
            Some(FailureOutcome::RetryScheduled(at)) => {
                let delay = (at - Utc::now()).to_std().unwrap_or_default();
                warn!(
                    id = %stored.id,
                    reason = ?stored.failure_reason,
                    retry_count = stored.retry_count,
                    retry_in_ms = delay.as_millis() as u64,
                    "Settlement failed, retry scheduled"
                );
                self.queue.schedule_retry(&stored.id, delay);
            }
            Some(FailureOutcome::Exhausted) => warn!(
                id = %stored.id,
                reason = ?stored.failure_reason,
                retry_count = stored.retry_count,
                max_retries = settings.retry.max_retries,
                "Settlement failed, retries exhausted"
            ),
            Some(FailureOutcome::NotRetryable) => warn!(
                id = %stored.id,
                reason = ?stored.failure_reason,
                "Settlement rejected by ledger"
            ),
        }
    }
}

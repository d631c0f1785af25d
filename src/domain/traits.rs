//! Domain traits defining contracts for external systems.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{AppError, LedgerError};
use super::policy::{FeeSchedule, SettlementSettings};
use super::types::{
    FeeStatus, FeeTransaction, LedgerReceipt, PaginatedResponse, SettlementPayment,
};

/// Database client trait for fee transaction persistence
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new transaction; a second insert for the same trade id is `Duplicate`
    async fn insert_fee_transaction(&self, tx: &FeeTransaction)
    -> Result<FeeTransaction, AppError>;

    /// Get a single transaction by ID
    async fn get_fee_transaction(&self, id: &str) -> Result<Option<FeeTransaction>, AppError>;

    /// Get the transaction created for a trade
    async fn get_fee_transaction_by_trade_id(
        &self,
        trade_id: &str,
    ) -> Result<Option<FeeTransaction>, AppError>;

    /// Persist `tx` if the stored version still equals `tx.version`.
    ///
    /// Returns the stored record with its version bumped. A stale version fails
    /// with `ConcurrentModification`, a missing id with `NotFound`.
    async fn update_fee_transaction(&self, tx: &FeeTransaction)
    -> Result<FeeTransaction, AppError>;

    /// List transactions with cursor-based pagination, newest first
    async fn list_fee_transactions(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<FeeTransaction>, AppError>;

    /// Transactions in `status` created before `created_before`, oldest first
    async fn find_by_status(
        &self,
        status: FeeStatus,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError>;

    /// FAILED transactions whose scheduled retry is due
    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError>;

    /// FAILED transactions with nothing scheduled whose last submission, started
    /// before `attempted_before`, was never checked against the ledger
    async fn find_unchecked_failures(
        &self,
        attempted_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError>;
}

/// Settlement ledger client trait
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Check ledger gateway connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Submit a fee payment and wait for the ledger to accept or reject it
    async fn submit(&self, payment: &SettlementPayment) -> Result<LedgerReceipt, LedgerError>;

    /// Look up an accepted payment by its memo
    async fn find_payment_by_memo(&self, memo: &str) -> Result<Option<LedgerReceipt>, AppError> {
        let _ = memo;
        Err(AppError::NotSupported(
            "find_payment_by_memo not implemented".to_string(),
        ))
    }
}

/// Source of the business configuration
pub trait ConfigProvider: Send + Sync {
    /// Current settings snapshot
    fn settings(&self) -> Arc<SettlementSettings>;

    /// Swap the fee schedule for subsequent computations
    fn replace_fee_schedule(&self, schedule: FeeSchedule) -> Result<(), AppError> {
        let _ = schedule;
        Err(AppError::NotSupported(
            "fee schedule is read-only".to_string(),
        ))
    }
}

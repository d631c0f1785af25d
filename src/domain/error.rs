//! Error taxonomy for the settlement service.

use thiserror::Error;

use super::types::FeeStatus;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Fee error: {0}")]
    Fee(#[from] FeeError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

impl AppError {
    /// True when a compare-and-swap on the transaction version was lost
    #[must_use]
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(
            self,
            AppError::Settlement(SettlementError::ConcurrentModification(_))
        )
    }

    /// True when the requested record does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Database(DatabaseError::NotFound(_)))
    }
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseError::Duplicate(db_err.message().to_string())
            }
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Settlement ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger submission failed (retryable: {retryable}): {reason}")]
    SubmissionFailed { retryable: bool, reason: String },

    #[error("Ledger connection failed: {0}")]
    Connection(String),

    #[error("Ledger request timed out: {0}")]
    Timeout(String),

    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),

    #[error("Invalid signing key: {0}")]
    InvalidSigningKey(String),
}

impl LedgerError {
    /// Whether a failed submission may succeed if attempted again.
    ///
    /// A response that could not be parsed is treated as retryable: the payment
    /// may have landed, and resubmission is guarded by the memo lookup.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::SubmissionFailed { retryable, .. } => *retryable,
            LedgerError::Connection(_)
            | LedgerError::Timeout(_)
            | LedgerError::InvalidResponse(_) => true,
            LedgerError::InvalidSigningKey(_) => false,
        }
    }
}

/// Fee computation and amount errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeeError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid fee rate: {0}")]
    InvalidRate(String),

    #[error("Amount exceeds the representable magnitude")]
    Overflow,

    #[error("Unknown promotion code: {0}")]
    UnknownPromotionCode(String),
}

/// Fee transaction lifecycle errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: FeeStatus, to: FeeStatus },

    #[error("Fee transaction {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Retries exhausted for fee transaction {id} ({retry_count}/{max_retries})")]
    RetryExhausted {
        id: String,
        retry_count: i32,
        max_retries: u32,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Request validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("{0}")]
    Multiple(String),
}

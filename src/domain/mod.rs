//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod lifecycle;
pub mod money;
pub mod policy;
pub mod traits;
pub mod types;

pub use error::{
    AppError, ConfigError, DatabaseError, FeeError, LedgerError, SettlementError, ValidationError,
};
pub use lifecycle::{FailureOutcome, RefundOutcome};
pub use money::{Money, Ratio};
pub use policy::{
    FeeDecision, FeeSchedule, Promotion, PromotionSnapshot, RetryPolicy, SettlementSettings,
    TierRates, UnknownPromotionPolicy,
};
pub use traits::{ConfigProvider, DatabaseClient, LedgerClient};
pub use types::{
    Asset, ErrorDetail, ErrorResponse, FeeMetadata, FeeQuote, FeeQuoteRequest, FeeSnapshot,
    FeeStatus, FeeTier, FeeTransaction, HealthResponse, HealthStatus, InitiateSettlementRequest,
    LedgerReceipt, PaginatedResponse, PaginationParams, RateLimitResponse, SettlementPayment,
    UserContext, UserTier,
};

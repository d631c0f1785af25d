//! Domain types with validation support.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use validator::Validate;

use super::money::{Money, Ratio};
use super::policy::{FeeDecision, PromotionSnapshot};

/// Asset code of the ledger's native asset, which has no issuer
pub const NATIVE_ASSET_CODE: &str = "XLM";

/// Fee classification that selects the applied rate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeTier {
    Standard,
    HighVolume,
    Vip,
    Promotional,
}

impl FeeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::HighVolume => "HIGH_VOLUME",
            Self::Vip => "VIP",
            Self::Promotional => "PROMOTIONAL",
        }
    }
}

impl std::str::FromStr for FeeTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDARD" => Ok(Self::Standard),
            "HIGH_VOLUME" => Ok(Self::HighVolume),
            "VIP" => Ok(Self::Vip),
            "PROMOTIONAL" => Ok(Self::Promotional),
            _ => Err(format!("Invalid fee tier: {}", s)),
        }
    }
}

impl std::fmt::Display for FeeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a fee transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeStatus {
    /// Created or queued for (re)submission to the ledger
    #[default]
    Pending,
    /// Confirmed by the ledger
    Collected,
    /// Rejected by the ledger or timed out; may be retried
    Failed,
    /// Reversed after collection
    Refunded,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Collected => "COLLECTED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl std::str::FromStr for FeeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COLLECTED" => Ok(Self::Collected),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            _ => Err(format!("Invalid fee status: {}", s)),
        }
    }
}

impl std::fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User classification supplied by the caller at computation time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserTier {
    #[default]
    Standard,
    Vip,
}

/// Ledger asset a fee is settled in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Asset {
    /// Asset code (1-12 alphanumeric characters)
    #[schema(example = "USDC")]
    pub asset_code: String,
    /// Issuing account; absent only for the native asset
    #[schema(example = "GA5ZSEJYB37JRC5AVCIA5MOP4RHTM335X2KGX3IHOJAPP5RE34K4KZVN")]
    pub asset_issuer: Option<String>,
}

impl Asset {
    #[must_use]
    pub fn native() -> Self {
        Self {
            asset_code: NATIVE_ASSET_CODE.to_string(),
            asset_issuer: None,
        }
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        self.asset_code == NATIVE_ASSET_CODE && self.asset_issuer.is_none()
    }

    /// Check the code format and that every non-native asset names its issuer
    pub fn check(&self) -> Result<(), String> {
        let code_ok = !self.asset_code.is_empty()
            && self.asset_code.len() <= 12
            && self.asset_code.chars().all(|c| c.is_ascii_alphanumeric());
        if !code_ok {
            return Err(format!(
                "asset code must be 1-12 alphanumeric characters, got '{}'",
                self.asset_code
            ));
        }
        match &self.asset_issuer {
            None if self.asset_code != NATIVE_ASSET_CODE => Err(format!(
                "asset {} requires an issuer",
                self.asset_code
            )),
            Some(issuer) if issuer.trim().is_empty() => {
                Err("asset issuer must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Caller-supplied snapshot of the user a fee is computed for
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct UserContext {
    /// Opaque user identifier
    #[validate(length(min = 1, max = 128, message = "User id is required"))]
    #[schema(example = "user_42")]
    pub user_id: String,
    /// Tier classification of the user
    #[serde(default)]
    pub user_tier: UserTier,
    /// Trailing monthly trading volume
    #[serde(default)]
    #[schema(value_type = String, example = "250000.0000000")]
    pub monthly_volume: Money,
    /// Optional promotion code
    #[validate(length(min = 1, max = 64, message = "Promotion code must be 1-64 characters"))]
    #[schema(example = "LAUNCH2024")]
    pub promotion_code: Option<String>,
}

impl UserContext {
    #[must_use]
    pub fn new(user_id: impl Into<String>, user_tier: UserTier, monthly_volume: Money) -> Self {
        Self {
            user_id: user_id.into(),
            user_tier,
            monthly_volume,
            promotion_code: None,
        }
    }

    #[must_use]
    pub fn with_promotion(mut self, code: impl Into<String>) -> Self {
        self.promotion_code = Some(code.into());
        self
    }
}

/// Fee metadata, versioned so stored records stay readable as it evolves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "schema_version")]
pub enum FeeMetadata {
    #[serde(rename = "1")]
    V1(FeeSnapshot),
}

impl FeeMetadata {
    #[must_use]
    pub fn snapshot(&self) -> &FeeSnapshot {
        match self {
            Self::V1(snapshot) => snapshot,
        }
    }
}

/// Inputs of the fee computation as they were when the fee was fixed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct FeeSnapshot {
    pub user_tier: UserTier,
    #[schema(value_type = String, example = "250000.0000000")]
    pub monthly_volume: Money,
    /// Present when a promotion overrode the regular tier
    pub promotion: Option<PromotionSnapshot>,
}

/// Quote returned by fee computation, without side effects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FeeQuote {
    #[schema(value_type = String, example = "1000.0000000")]
    pub trade_amount: Money,
    #[schema(value_type = String, example = "0.0010")]
    pub fee_rate: Ratio,
    pub fee_tier: FeeTier,
    #[schema(value_type = String, example = "1.0000000")]
    pub fee_amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionSnapshot>,
}

impl FeeQuote {
    /// Apply a fee decision to a trade amount
    pub fn from_decision(
        trade_amount: Money,
        decision: FeeDecision,
    ) -> Result<Self, super::error::FeeError> {
        let fee_amount = trade_amount.multiply_by_rate(decision.fee_rate)?;
        Ok(Self {
            trade_amount,
            fee_rate: decision.fee_rate,
            fee_tier: decision.fee_tier,
            fee_amount,
            promotion: decision.promotion,
        })
    }
}

/// Fee charged for a trade and its settlement on the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FeeTransaction {
    /// Unique identifier (UUID v7)
    #[schema(example = "01920f3e-7c1a-7d3e-8f1a-2b3c4d5e6f70")]
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Trade that triggered the fee
    pub trade_id: Option<String>,
    #[schema(value_type = String, example = "1000.0000000")]
    pub trade_amount: Money,
    #[schema(value_type = String, example = "1.0000000")]
    pub fee_amount: Money,
    #[schema(value_type = String, example = "0.0010")]
    pub fee_rate: Ratio,
    pub fee_tier: FeeTier,
    pub status: FeeStatus,
    /// Ledger transaction hash once collected
    pub ledger_tx_hash: Option<String>,
    #[serde(flatten)]
    pub asset: Asset,
    /// Platform wallet receiving the fee
    pub destination_address: Option<String>,
    /// Last ledger failure; set only while FAILED
    pub failure_reason: Option<String>,
    /// Failed settlement attempts that consumed a retry slot
    pub retry_count: i32,
    /// When the next automatic retry is due; absent when none is scheduled
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When a submission to the ledger was last started
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub metadata: FeeMetadata,
    /// Optimistic lock version, bumped by every persisted update
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only while COLLECTED
    pub collected_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl FeeTransaction {
    /// Create a PENDING transaction from a computed quote
    #[must_use]
    pub fn new(
        quote: &FeeQuote,
        user: &UserContext,
        trade_id: Option<String>,
        asset: Asset,
        destination_address: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: user.user_id.clone(),
            trade_id,
            trade_amount: quote.trade_amount,
            fee_amount: quote.fee_amount,
            fee_rate: quote.fee_rate,
            fee_tier: quote.fee_tier,
            status: FeeStatus::Pending,
            ledger_tx_hash: None,
            asset,
            destination_address,
            failure_reason: None,
            retry_count: 0,
            next_retry_at: None,
            last_attempt_at: None,
            metadata: FeeMetadata::V1(FeeSnapshot {
                user_tier: user.user_tier,
                monthly_volume: user.monthly_volume,
                promotion: quote.promotion.clone(),
            }),
            version: 1,
            created_at: now,
            updated_at: now,
            collected_at: None,
            refunded_at: None,
        }
    }

    /// Deterministic memo attached to the ledger payment (base64 SHA-256 of the id)
    #[must_use]
    pub fn settlement_memo(&self) -> String {
        let digest = Sha256::digest(format!("fee-settlement:{}", self.id).as_bytes());
        STANDARD.encode(digest)
    }
}

/// Payment handed to the ledger collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementPayment {
    pub amount: Money,
    pub asset: Asset,
    pub destination: String,
    pub memo: String,
}

/// Ledger acknowledgement of an accepted payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub tx_hash: String,
}

/// Request for a side-effect free fee quote
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct FeeQuoteRequest {
    #[schema(value_type = String, example = "1000.0000000")]
    pub trade_amount: Money,
    #[validate(nested)]
    pub user: UserContext,
}

/// Request to compute a fee and settle it on the ledger
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct InitiateSettlementRequest {
    /// Trade that triggered the fee; repeated requests for the same trade are idempotent
    #[validate(length(min = 1, max = 128, message = "Trade id must be 1-128 characters"))]
    #[schema(example = "trade_9f2c")]
    pub trade_id: Option<String>,
    #[schema(value_type = String, example = "1000.0000000")]
    pub trade_amount: Money,
    #[validate(nested)]
    pub user: UserContext,
    #[validate(length(min = 1, max = 12, message = "Asset code must be 1-12 characters"))]
    #[schema(example = "USDC")]
    pub asset_code: String,
    #[schema(example = "GA5ZSEJYB37JRC5AVCIA5MOP4RHTM335X2KGX3IHOJAPP5RE34K4KZVN")]
    pub asset_issuer: Option<String>,
    /// Falls back to the configured platform wallet when absent
    #[validate(length(min = 1, message = "Destination address must not be empty"))]
    #[schema(example = "GBRPYHIL2CI3FNQ4BXLFMNDLFJUNPU2HY3ZMFSHONUCEOASW7QC7OX2H")]
    pub destination_address: Option<String>,
}

impl InitiateSettlementRequest {
    #[must_use]
    pub fn asset(&self) -> Asset {
        Asset {
            asset_code: self.asset_code.clone(),
            asset_issuer: self.asset_issuer.clone(),
        }
    }
}

/// Pagination parameters for list requests
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct PaginationParams {
    /// Maximum number of items to return (1-100, default: 20)
    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    #[serde(default = "default_limit")]
    #[schema(example = 20)]
    pub limit: i64,
    /// Cursor for pagination (ID to start after)
    pub cursor: Option<String>,
}

fn default_limit() -> i64 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            cursor: None,
        }
    }
}

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T: ToSchema> {
    pub items: Vec<T>,
    /// Cursor for next page (null if no more items)
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl<T: ToSchema> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>, has_more: bool) -> Self {
        Self {
            items,
            next_cursor,
            has_more,
        }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub ledger: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    /// The ledger is not on the request path, so losing it only degrades the service
    #[must_use]
    pub fn new(database: HealthStatus, ledger: HealthStatus) -> Self {
        let status = match (&database, &ledger) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            ledger,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "invalid_state_transition")]
    pub r#type: String,
    /// Human-readable error message
    pub message: String,
}

/// Rate limit exceeded response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    pub error: ErrorDetail,
    /// Seconds until rate limit resets
    #[schema(example = 1)]
    pub retry_after: u64,
}

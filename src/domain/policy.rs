//! Fee policy engine and injected business configuration.
//!
//! Nothing here carries business values: rates, thresholds, promotions and
//! retry limits all arrive through [`SettlementSettings`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::{ConfigError, FeeError};
use super::money::{Money, Ratio};
use super::types::{FeeQuote, FeeTier, UserContext, UserTier};

/// Fee rate of each non-promotional tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TierRates {
    #[schema(value_type = String, example = "0.0010")]
    pub standard: Ratio,
    #[schema(value_type = String, example = "0.0008")]
    pub high_volume: Ratio,
    #[schema(value_type = String, example = "0.0005")]
    pub vip: Ratio,
}

impl TierRates {
    #[must_use]
    pub fn rate_for(&self, tier: FeeTier) -> Option<Ratio> {
        match tier {
            FeeTier::Standard => Some(self.standard),
            FeeTier::HighVolume => Some(self.high_volume),
            FeeTier::Vip => Some(self.vip),
            FeeTier::Promotional => None,
        }
    }
}

/// Promotion code entry of the fee schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Promotion {
    /// Matched case-insensitively
    #[schema(example = "LAUNCH2024")]
    pub code: String,
    #[schema(value_type = String, example = "0.0000")]
    pub rate: Ratio,
    #[serde(default = "default_active")]
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl Promotion {
    /// Active and not yet expired at `now`
    #[must_use]
    pub fn is_applicable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|expires_at| now < expires_at)
    }
}

/// What to do with a promotion code missing from the table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPromotionPolicy {
    /// Fail the computation with `UnknownPromotionCode`
    #[default]
    Reject,
    /// Ignore the code and evaluate the regular tiers
    FallBack,
}

/// Rate table and tier rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct FeeSchedule {
    pub rates: TierRates,
    /// Monthly volume at or above which HIGH_VOLUME applies
    #[schema(value_type = String, example = "100000.0000000")]
    pub high_volume_threshold: Money,
    #[serde(default)]
    pub promotions: Vec<Promotion>,
    #[serde(default)]
    pub unknown_promotion: UnknownPromotionPolicy,
}

/// Rate and tier chosen for a trade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeDecision {
    pub fee_rate: Ratio,
    pub fee_tier: FeeTier,
    pub promotion: Option<PromotionSnapshot>,
}

/// Promotion override recorded with the transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct PromotionSnapshot {
    /// Code as configured in the schedule
    pub code: String,
    /// Tier that would have applied without the promotion
    pub original_tier: FeeTier,
    #[schema(value_type = String, example = "0.0010")]
    pub original_rate: Ratio,
}

impl FeeSchedule {
    /// Reject tables that cannot be evaluated unambiguously
    pub fn check(&self) -> Result<(), ConfigError> {
        for (index, promotion) in self.promotions.iter().enumerate() {
            if promotion.code.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: "promotions".to_string(),
                    message: format!("promotion #{index} has an empty code"),
                });
            }
            let duplicate = self.promotions[..index]
                .iter()
                .any(|other| other.code.eq_ignore_ascii_case(&promotion.code));
            if duplicate {
                return Err(ConfigError::Invalid {
                    key: "promotions".to_string(),
                    message: format!("promotion code '{}' is listed twice", promotion.code),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn find_promotion(&self, code: &str) -> Option<&Promotion> {
        let code = code.trim();
        self.promotions
            .iter()
            .find(|promotion| promotion.code.eq_ignore_ascii_case(code))
    }

    /// Select the fee rate and tier for a trade.
    ///
    /// First match wins: an applicable promotion, then monthly volume at or above
    /// the threshold, then the VIP flag, then STANDARD. A known promotion that is
    /// inactive or expired is skipped silently; an unknown one is handled per
    /// [`UnknownPromotionPolicy`].
    pub fn compute_fee(
        &self,
        trade_amount: Money,
        user: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<FeeDecision, FeeError> {
        if trade_amount.is_zero() {
            return Err(FeeError::InvalidAmount(
                "trade amount must be greater than zero".to_string(),
            ));
        }

        let regular_tier = if user.monthly_volume >= self.high_volume_threshold {
            FeeTier::HighVolume
        } else if user.user_tier == UserTier::Vip {
            FeeTier::Vip
        } else {
            FeeTier::Standard
        };
        let regular_rate = self
            .rates
            .rate_for(regular_tier)
            .unwrap_or(self.rates.standard);

        if let Some(code) = user.promotion_code.as_deref() {
            match self.find_promotion(code) {
                Some(promotion) if promotion.is_applicable(now) => {
                    return Ok(FeeDecision {
                        fee_rate: promotion.rate,
                        fee_tier: FeeTier::Promotional,
                        promotion: Some(PromotionSnapshot {
                            code: promotion.code.clone(),
                            original_tier: regular_tier,
                            original_rate: regular_rate,
                        }),
                    });
                }
                Some(_) => {}
                None if self.unknown_promotion == UnknownPromotionPolicy::Reject => {
                    return Err(FeeError::UnknownPromotionCode(code.to_string()));
                }
                None => {}
            }
        }

        Ok(FeeDecision {
            fee_rate: regular_rate,
            fee_tier: regular_tier,
            promotion: None,
        })
    }

    /// Compute the full quote for a trade
    pub fn quote(
        &self,
        trade_amount: Money,
        user: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<FeeQuote, FeeError> {
        let decision = self.compute_fee(trade_amount, user, now)?;
        FeeQuote::from_decision(trade_amount, decision)
    }
}

/// Bounds and pacing of automatic settlement retries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RetryPolicy {
    /// Failed attempts allowed before the transaction stays FAILED
    pub max_retries: u32,
    /// Delay before the first retry
    pub backoff_base_ms: u64,
    /// Upper bound on any single delay
    pub backoff_cap_ms: u64,
}

impl RetryPolicy {
    /// Whether a transaction that has failed `retry_count` times may go back to PENDING
    #[must_use]
    pub fn allows_retry(&self, retry_count: i32) -> bool {
        i64::from(retry_count) < i64::from(self.max_retries)
    }

    /// Delay before the retry that follows failure number `retry_count` (1-based):
    /// `base * 2^(retry_count - 1)`, capped.
    #[must_use]
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).clamp(0, 32) as u32;
        let delay = self
            .backoff_base_ms
            .saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.backoff_cap_ms))
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid {
                key: "backoff_cap_ms".to_string(),
                message: format!(
                    "cap {} ms is below the base delay {} ms",
                    self.backoff_cap_ms, self.backoff_base_ms
                ),
            });
        }
        Ok(())
    }
}

/// Business configuration consumed by the settlement coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SettlementSettings {
    pub fee_schedule: FeeSchedule,
    pub retry: RetryPolicy,
    /// Destination used when a settlement request names none
    #[serde(default)]
    pub platform_wallet: Option<String>,
    /// Upper bound on a single ledger submission
    #[serde(default = "default_submission_timeout_ms")]
    pub submission_timeout_ms: u64,
}

fn default_submission_timeout_ms() -> u64 {
    30_000
}

impl SettlementSettings {
    pub fn check(&self) -> Result<(), ConfigError> {
        self.fee_schedule.check()?;
        self.retry.check()?;
        if self.submission_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "submission_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }
}

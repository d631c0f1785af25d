//! Fixed-point monetary amounts and fee rates.
//!
//! Amounts carry exactly [`MONEY_SCALE`] fractional digits and at most
//! [`MONEY_PRECISION`] digits in total, matching the `NUMERIC(20,7)` columns they
//! are stored in. Rates carry [`RATE_SCALE`] fractional digits. Neither type is
//! ever backed by binary floating point.

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::error::FeeError;

/// Fractional digits of every [`Money`] value
pub const MONEY_SCALE: u32 = 7;

/// Total significant digits of every [`Money`] value
pub const MONEY_PRECISION: u32 = 20;

/// Fractional digits of every [`Ratio`] value
pub const RATE_SCALE: u32 = 4;

/// Largest mantissa representable with [`MONEY_PRECISION`] digits
const MAX_MONEY_MANTISSA: i128 = 10i128.pow(MONEY_PRECISION) - 1;

/// Non-negative amount with seven fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::from_parts(0, 0, 0, false, MONEY_SCALE));

    /// Largest representable amount (`9999999999999.9999999`)
    #[must_use]
    pub fn max_value() -> Self {
        Money(Decimal::from_i128_with_scale(MAX_MONEY_MANTISSA, MONEY_SCALE))
    }

    /// Build an amount from its integer units and fractional digits.
    ///
    /// `Money::of(12, "5")` is `12.5000000`. Fails with `InvalidAmount` when
    /// `units` is negative, or when `fraction` is not all digits or has more
    /// than seven of them.
    pub fn of(units: i64, fraction: &str) -> Result<Self, FeeError> {
        if units < 0 {
            return Err(FeeError::InvalidAmount(format!(
                "amount must not be negative, got {units}"
            )));
        }
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(FeeError::InvalidAmount(format!(
                "fractional digits must be numeric, got '{fraction}'"
            )));
        }
        if fraction.len() as u32 > MONEY_SCALE {
            return Err(FeeError::InvalidAmount(format!(
                "at most {MONEY_SCALE} fractional digits allowed, got {}",
                fraction.len()
            )));
        }
        let padded = format!("{fraction:0<width$}", width = MONEY_SCALE as usize);
        let fractional: i128 = padded.parse().unwrap_or(0);
        let mantissa = (units as i128)
            .checked_mul(10i128.pow(MONEY_SCALE))
            .and_then(|m| m.checked_add(fractional))
            .ok_or(FeeError::Overflow)?;
        if mantissa > MAX_MONEY_MANTISSA {
            return Err(FeeError::Overflow);
        }
        Ok(Money(Decimal::from_i128_with_scale(mantissa, MONEY_SCALE)))
    }

    /// Validate an arbitrary decimal as an amount.
    ///
    /// The value must be non-negative, representable with seven fractional digits
    /// (trailing zeros beyond that are accepted) and below the magnitude limit.
    pub fn from_decimal(value: Decimal) -> Result<Self, FeeError> {
        if value.is_zero() {
            return Ok(Self::ZERO);
        }
        if value.is_sign_negative() {
            return Err(FeeError::InvalidAmount(format!(
                "amount must not be negative, got {value}"
            )));
        }
        let normalized = value.normalize();
        if normalized.scale() > MONEY_SCALE {
            return Err(FeeError::InvalidAmount(format!(
                "at most {MONEY_SCALE} fractional digits allowed, got {value}"
            )));
        }
        if normalized > Self::max_value().0 {
            return Err(FeeError::Overflow);
        }
        let mut scaled = normalized;
        scaled.rescale(MONEY_SCALE);
        Ok(Money(scaled))
    }

    #[must_use]
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Exact addition; `Overflow` past the magnitude limit.
    pub fn checked_add(self, other: Money) -> Result<Money, FeeError> {
        let sum = self.0.checked_add(other.0).ok_or(FeeError::Overflow)?;
        Self::from_decimal(sum)
    }

    /// Exact subtraction; `InvalidAmount` when the result would be negative.
    pub fn checked_sub(self, other: Money) -> Result<Money, FeeError> {
        let difference = self.0.checked_sub(other.0).ok_or(FeeError::Overflow)?;
        Self::from_decimal(difference)
    }

    /// Multiply by a rate, rounding half-to-even at the seventh fractional digit.
    pub fn multiply_by_rate(self, rate: Ratio) -> Result<Money, FeeError> {
        let product = self.0.checked_mul(rate.0).ok_or(FeeError::Overflow)?;
        Self::from_decimal(
            product.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven),
        )
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = FeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str_exact(s.trim())
            .map_err(|e| FeeError::InvalidAmount(format!("'{s}' is not a decimal amount: {e}")))?;
        Self::from_decimal(value)
    }
}

impl TryFrom<String> for Money {
    type Error = FeeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Money> for String {
    fn from(value: Money) -> Self {
        value.to_string()
    }
}

/// Fee rate between 0 and 1 with four fractional digits (`0.0010` is 0.1%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ratio(Decimal);

impl Ratio {
    pub const ZERO: Ratio = Ratio(Decimal::from_parts(0, 0, 0, false, RATE_SCALE));

    /// `Ratio::new(10, 4)` is `0.0010`.
    pub fn new(mantissa: i64, scale: u32) -> Result<Self, FeeError> {
        if scale > RATE_SCALE {
            return Err(FeeError::InvalidRate(format!(
                "at most {RATE_SCALE} fractional digits allowed, got {scale}"
            )));
        }
        Self::from_decimal(Decimal::new(mantissa, scale))
    }

    pub fn from_decimal(value: Decimal) -> Result<Self, FeeError> {
        if value.is_zero() {
            return Ok(Self::ZERO);
        }
        if value.is_sign_negative() {
            return Err(FeeError::InvalidRate(format!(
                "rate must not be negative, got {value}"
            )));
        }
        if value > Decimal::ONE {
            return Err(FeeError::InvalidRate(format!(
                "rate must not exceed 1, got {value}"
            )));
        }
        let normalized = value.normalize();
        if normalized.scale() > RATE_SCALE {
            return Err(FeeError::InvalidRate(format!(
                "at most {RATE_SCALE} fractional digits allowed, got {value}"
            )));
        }
        let mut scaled = normalized;
        scaled.rescale(RATE_SCALE);
        Ok(Ratio(scaled))
    }

    #[must_use]
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Ratio {
    type Err = FeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str_exact(s.trim())
            .map_err(|e| FeeError::InvalidRate(format!("'{s}' is not a decimal rate: {e}")))?;
        Self::from_decimal(value)
    }
}

impl TryFrom<String> for Ratio {
    type Error = FeeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ratio> for String {
    fn from(value: Ratio) -> Self {
        value.to_string()
    }
}

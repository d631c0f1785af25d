//! Business configuration loading and the in-memory provider.
//!
//! Settings come either from a JSON document named by `FEE_SCHEDULE_PATH` or
//! from individual environment variables:
//!
//! | Variable | Required | Default |
//! |---|---|---|
//! | `FEE_RATE_STANDARD`, `FEE_RATE_HIGH_VOLUME`, `FEE_RATE_VIP` | yes | |
//! | `FEE_HIGH_VOLUME_THRESHOLD` | yes | |
//! | `FEE_PROMOTIONS` (JSON array) | no | `[]` |
//! | `FEE_UNKNOWN_PROMOTION` (`reject` / `fall_back`) | no | `reject` |
//! | `SETTLEMENT_MAX_RETRIES` | no | `3` |
//! | `SETTLEMENT_BACKOFF_BASE_MS` / `SETTLEMENT_BACKOFF_CAP_MS` | no | `1000` / `60000` |
//! | `SETTLEMENT_SUBMISSION_TIMEOUT_MS` | no | `30000` |
//! | `PLATFORM_WALLET` | no | |

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::domain::{
    AppError, ConfigError, ConfigProvider, FeeSchedule, Promotion, RetryPolicy,
    SettlementSettings, TierRates, UnknownPromotionPolicy,
};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;
const DEFAULT_SUBMISSION_TIMEOUT_MS: u64 = 30_000;

/// Load settings from the process environment
pub fn settings_from_env() -> Result<SettlementSettings, ConfigError> {
    if let Ok(path) = std::env::var("FEE_SCHEDULE_PATH") {
        return settings_from_file(&path);
    }
    settings_from_source(|key| std::env::var(key).ok())
}

/// Load settings from a JSON document on disk
pub fn settings_from_file(path: &str) -> Result<SettlementSettings, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        key: "FEE_SCHEDULE_PATH".to_string(),
        message: format!("cannot read {path}: {e}"),
    })?;
    let settings = settings_from_json(&raw)?;
    info!(path = %path, "Loaded settlement settings from file");
    Ok(settings)
}

/// Parse and validate a JSON settings document
pub fn settings_from_json(raw: &str) -> Result<SettlementSettings, ConfigError> {
    let settings: SettlementSettings =
        serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
            key: "FEE_SCHEDULE_PATH".to_string(),
            message: e.to_string(),
        })?;
    settings.check()?;
    Ok(settings)
}

/// Build settings from a key lookup, typically the environment
pub fn settings_from_source<F>(lookup: F) -> Result<SettlementSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    };

    let rates = TierRates {
        standard: parse_value("FEE_RATE_STANDARD", &required("FEE_RATE_STANDARD")?)?,
        high_volume: parse_value("FEE_RATE_HIGH_VOLUME", &required("FEE_RATE_HIGH_VOLUME")?)?,
        vip: parse_value("FEE_RATE_VIP", &required("FEE_RATE_VIP")?)?,
    };
    let high_volume_threshold = parse_value(
        "FEE_HIGH_VOLUME_THRESHOLD",
        &required("FEE_HIGH_VOLUME_THRESHOLD")?,
    )?;

    let promotions: Vec<Promotion> = match lookup("FEE_PROMOTIONS") {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                key: "FEE_PROMOTIONS".to_string(),
                message: e.to_string(),
            })?
        }
        _ => Vec::new(),
    };

    let unknown_promotion = match lookup("FEE_UNKNOWN_PROMOTION").as_deref().map(str::trim) {
        None | Some("") | Some("reject") => UnknownPromotionPolicy::Reject,
        Some("fall_back") | Some("fallback") => UnknownPromotionPolicy::FallBack,
        Some(other) => {
            return Err(ConfigError::Invalid {
                key: "FEE_UNKNOWN_PROMOTION".to_string(),
                message: format!("expected reject or fall_back, got {other}"),
            });
        }
    };

    let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let retry = RetryPolicy {
        max_retries: optional("SETTLEMENT_MAX_RETRIES")
            .map(|v| parse_value("SETTLEMENT_MAX_RETRIES", &v))
            .transpose()?
            .unwrap_or(DEFAULT_MAX_RETRIES),
        backoff_base_ms: optional("SETTLEMENT_BACKOFF_BASE_MS")
            .map(|v| parse_value("SETTLEMENT_BACKOFF_BASE_MS", &v))
            .transpose()?
            .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
        backoff_cap_ms: optional("SETTLEMENT_BACKOFF_CAP_MS")
            .map(|v| parse_value("SETTLEMENT_BACKOFF_CAP_MS", &v))
            .transpose()?
            .unwrap_or(DEFAULT_BACKOFF_CAP_MS),
    };

    let settings = SettlementSettings {
        fee_schedule: FeeSchedule {
            rates,
            high_volume_threshold,
            promotions,
            unknown_promotion,
        },
        retry,
        platform_wallet: optional("PLATFORM_WALLET"),
        submission_timeout_ms: optional("SETTLEMENT_SUBMISSION_TIMEOUT_MS")
            .map(|v| parse_value("SETTLEMENT_SUBMISSION_TIMEOUT_MS", &v))
            .transpose()?
            .unwrap_or(DEFAULT_SUBMISSION_TIMEOUT_MS),
    };
    settings.check()?;
    Ok(settings)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Settings held in memory; the fee schedule can be swapped at runtime
pub struct InMemoryConfigProvider {
    settings: RwLock<Arc<SettlementSettings>>,
}

impl InMemoryConfigProvider {
    pub fn new(settings: SettlementSettings) -> Result<Self, ConfigError> {
        settings.check()?;
        Ok(Self {
            settings: RwLock::new(Arc::new(settings)),
        })
    }
}

impl ConfigProvider for InMemoryConfigProvider {
    fn settings(&self) -> Arc<SettlementSettings> {
        match self.settings.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn replace_fee_schedule(&self, schedule: FeeSchedule) -> Result<(), AppError> {
        schedule.check()?;
        let mut guard = self
            .settings
            .write()
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))?;
        let mut next = (**guard).clone();
        next.fee_schedule = schedule;
        *guard = Arc::new(next);
        info!("Fee schedule replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn base_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("FEE_RATE_STANDARD", "0.0010"),
            ("FEE_RATE_HIGH_VOLUME", "0.0008"),
            ("FEE_RATE_VIP", "0.0005"),
            ("FEE_HIGH_VOLUME_THRESHOLD", "100000"),
        ]
    }

    #[test]
    fn test_minimal_environment_uses_defaults() {
        let settings = settings_from_source(source(&base_pairs())).unwrap();
        assert_eq!(settings.fee_schedule.rates.standard.to_string(), "0.0010");
        assert_eq!(
            settings.fee_schedule.high_volume_threshold.to_string(),
            "100000.0000000"
        );
        assert!(settings.fee_schedule.promotions.is_empty());
        assert_eq!(
            settings.fee_schedule.unknown_promotion,
            UnknownPromotionPolicy::Reject
        );
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.backoff_base_ms, 1_000);
        assert_eq!(settings.submission_timeout_ms, 30_000);
        assert!(settings.platform_wallet.is_none());
    }

    #[test]
    fn test_missing_rate_is_reported() {
        let pairs: Vec<_> = base_pairs()
            .into_iter()
            .filter(|(k, _)| *k != "FEE_RATE_VIP")
            .collect();
        let err = settings_from_source(source(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref key) if key == "FEE_RATE_VIP"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut pairs = base_pairs();
        pairs.push(("FEE_RATE_STANDARD", "1.5"));
        let err = settings_from_source(source(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "FEE_RATE_STANDARD"));

        let mut pairs = base_pairs();
        pairs.push(("FEE_UNKNOWN_PROMOTION", "ignore"));
        assert!(settings_from_source(source(&pairs)).is_err());

        let mut pairs = base_pairs();
        pairs.push(("SETTLEMENT_BACKOFF_BASE_MS", "5000"));
        pairs.push(("SETTLEMENT_BACKOFF_CAP_MS", "100"));
        assert!(settings_from_source(source(&pairs)).is_err());
    }

    #[test]
    fn test_promotions_and_overrides() {
        let mut pairs = base_pairs();
        pairs.push((
            "FEE_PROMOTIONS",
            r#"[{"code":"LAUNCH","rate":"0.0001"},{"code":"FREE","rate":"0","active":false}]"#,
        ));
        pairs.push(("FEE_UNKNOWN_PROMOTION", "fall_back"));
        pairs.push(("SETTLEMENT_MAX_RETRIES", "5"));
        pairs.push(("PLATFORM_WALLET", "GPLATFORM"));
        let settings = settings_from_source(source(&pairs)).unwrap();

        assert_eq!(settings.fee_schedule.promotions.len(), 2);
        assert!(settings.fee_schedule.promotions[0].active);
        assert!(!settings.fee_schedule.promotions[1].active);
        assert_eq!(
            settings.fee_schedule.unknown_promotion,
            UnknownPromotionPolicy::FallBack
        );
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.platform_wallet.as_deref(), Some("GPLATFORM"));
    }

    #[test]
    fn test_settings_from_json_document() {
        let raw = r#"{
            "fee_schedule": {
                "rates": { "standard": "0.0010", "high_volume": "0.0008", "vip": "0.0005" },
                "high_volume_threshold": "100000",
                "promotions": [{ "code": "LAUNCH", "rate": "0.0001" }]
            },
            "retry": { "max_retries": 4, "backoff_base_ms": 500, "backoff_cap_ms": 8000 }
        }"#;
        let settings = settings_from_json(raw).unwrap();
        assert_eq!(settings.retry.max_retries, 4);
        assert_eq!(settings.fee_schedule.promotions[0].code, "LAUNCH");

        assert!(settings_from_json("{").is_err());
    }

    #[test]
    fn test_in_memory_provider_replaces_schedule() {
        let settings = settings_from_source(source(&base_pairs())).unwrap();
        let provider = InMemoryConfigProvider::new(settings.clone()).unwrap();
        let before = provider.settings();

        let mut schedule = settings.fee_schedule.clone();
        schedule.rates.standard = "0.0020".parse().unwrap();
        provider.replace_fee_schedule(schedule).unwrap();

        assert_eq!(before.fee_schedule.rates.standard.to_string(), "0.0010");
        assert_eq!(
            provider.settings().fee_schedule.rates.standard.to_string(),
            "0.0020"
        );
        assert_eq!(provider.settings().retry, settings.retry);
    }

    #[test]
    fn test_in_memory_provider_rejects_duplicate_promotions() {
        let settings = settings_from_source(source(&base_pairs())).unwrap();
        let provider = InMemoryConfigProvider::new(settings.clone()).unwrap();

        let mut schedule = settings.fee_schedule;
        let promo: Promotion =
            serde_json::from_str(r#"{"code":"LAUNCH","rate":"0.0001"}"#).unwrap();
        schedule.promotions = vec![promo.clone(), promo];
        assert!(matches!(
            provider.replace_fee_schedule(schedule),
            Err(AppError::Config(_))
        ));
    }
}

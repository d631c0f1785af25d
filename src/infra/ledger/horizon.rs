//! HTTP client for a Horizon-style payment gateway.
//!
//! Endpoints:
//! - `POST /payments` submits a payment and answers once the ledger accepted or
//!   rejected it
//! - `GET /payments?memo_hash=` finds accepted payments by memo
//! - `GET /` reports gateway health
//!
//! Rejections carry Horizon result codes. Transaction-level codes that describe
//! a transient condition are retryable; operation-level codes are not.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signer, SigningKey};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AppError, LedgerClient, LedgerError, LedgerReceipt, SettlementPayment};

/// Transaction result codes worth resubmitting
const RETRYABLE_TX_CODES: &[&str] = &[
    "tx_bad_seq",
    "tx_insufficient_fee",
    "tx_too_late",
    "tx_internal_error",
];

/// Configuration for the gateway client
#[derive(Debug, Clone)]
pub struct LedgerClientConfig {
    /// Per-request HTTP timeout
    pub timeout: Duration,
}

impl Default for LedgerClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct PaymentRequest<'a> {
    destination: &'a str,
    amount: String,
    asset_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    asset_issuer: Option<&'a str>,
    memo_type: &'static str,
    memo: &'a str,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    hash: String,
    #[serde(default = "default_successful")]
    successful: bool,
}

fn default_successful() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    extras: Option<ProblemExtras>,
}

#[derive(Debug, Deserialize)]
struct ProblemExtras {
    result_codes: Option<ResultCodes>,
}

#[derive(Debug, Deserialize)]
struct ResultCodes {
    transaction: Option<String>,
    #[serde(default)]
    operations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentPage {
    #[serde(rename = "_embedded")]
    embedded: Embedded,
}

#[derive(Debug, Deserialize)]
struct Embedded {
    records: Vec<PaymentRecord>,
}

#[derive(Debug, Deserialize)]
struct PaymentRecord {
    transaction_hash: String,
    #[serde(default = "default_successful")]
    transaction_successful: bool,
}

/// Ledger client backed by a Horizon-style HTTP gateway
pub struct HorizonLedgerClient {
    http_client: Client,
    base_url: String,
    signing_key: Option<SigningKey>,
}

impl HorizonLedgerClient {
    pub fn new(
        base_url: &str,
        signing_key: Option<SigningKey>,
        config: LedgerClientConfig,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Ledger(LedgerError::Connection(e.to_string())))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            signing_key,
        })
    }

    pub fn with_defaults(base_url: &str, signing_key: Option<SigningKey>) -> Result<Self, AppError> {
        Self::new(base_url, signing_key, LedgerClientConfig::default())
    }

    /// Base64 public key requests are signed with, if any
    #[must_use]
    pub fn public_key(&self) -> Option<String> {
        self.signing_key
            .as_ref()
            .map(|key| STANDARD.encode(key.verifying_key().as_bytes()))
    }

    fn sign(&self, body: &[u8]) -> Option<(String, String)> {
        self.signing_key.as_ref().map(|key| {
            let signature = key.sign(body);
            (
                STANDARD.encode(key.verifying_key().as_bytes()),
                STANDARD.encode(signature.to_bytes()),
            )
        })
    }

    fn transport_error(e: reqwest::Error) -> LedgerError {
        if e.is_timeout() {
            LedgerError::Timeout(e.to_string())
        } else {
            LedgerError::Connection(e.to_string())
        }
    }

    /// Map a rejected submission to a ledger error with its retry class
    fn classify_rejection(status: StatusCode, body: &str) -> LedgerError {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return LedgerError::SubmissionFailed {
                retryable: true,
                reason: format!("gateway returned {status}"),
            };
        }

        let problem: Option<Problem> = serde_json::from_str(body).ok();
        let codes = problem
            .as_ref()
            .and_then(|p| p.extras.as_ref())
            .and_then(|extras| extras.result_codes.as_ref());

        match codes {
            Some(codes) => {
                let tx_code = codes.transaction.as_deref().unwrap_or("unknown");
                let retryable = codes.operations.is_empty() && RETRYABLE_TX_CODES.contains(&tx_code);
                let reason = if codes.operations.is_empty() {
                    tx_code.to_string()
                } else {
                    format!("{tx_code}: {}", codes.operations.join(","))
                };
                LedgerError::SubmissionFailed { retryable, reason }
            }
            None => LedgerError::SubmissionFailed {
                retryable: false,
                reason: problem
                    .map(|p| p.title)
                    .filter(|title| !title.is_empty())
                    .unwrap_or_else(|| format!("gateway returned {status}")),
            },
        }
    }
}

#[async_trait]
impl LedgerClient for HorizonLedgerClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let response = self
            .http_client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .map_err(|e| AppError::Ledger(Self::transport_error(e)))?;
        if !response.status().is_success() {
            return Err(AppError::Ledger(LedgerError::Connection(format!(
                "gateway health returned {}",
                response.status()
            ))));
        }
        Ok(())
    }

    #[instrument(skip(self, payment), fields(destination = %payment.destination, amount = %payment.amount))]
    async fn submit(&self, payment: &SettlementPayment) -> Result<LedgerReceipt, LedgerError> {
        let request = PaymentRequest {
            destination: &payment.destination,
            amount: payment.amount.to_string(),
            asset_code: &payment.asset.asset_code,
            asset_issuer: payment.asset.asset_issuer.as_deref(),
            memo_type: "hash",
            memo: &payment.memo,
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| LedgerError::InvalidResponse(format!("failed to encode payment: {e}")))?;

        let mut builder = self
            .http_client
            .post(format!("{}/payments", self.base_url))
            .header("Content-Type", "application/json");
        if let Some((public_key, signature)) = self.sign(&body) {
            builder = builder
                .header("X-Public-Key", public_key)
                .header("X-Signature", signature);
        }

        debug!("Submitting payment to ledger gateway");
        let response = builder
            .body(body)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(Self::transport_error)?;

        if !status.is_success() {
            let error = Self::classify_rejection(status, &text);
            warn!(status = %status, error = %error, "Ledger rejected payment");
            return Err(error);
        }

        let parsed: PaymentResponse = serde_json::from_str(&text)
            .map_err(|e| LedgerError::InvalidResponse(format!("{e}: {text}")))?;
        if !parsed.successful {
            return Err(LedgerError::SubmissionFailed {
                retryable: false,
                reason: format!("transaction {} was not successful", parsed.hash),
            });
        }

        info!(tx_hash = %parsed.hash, "Payment accepted by ledger");
        Ok(LedgerReceipt {
            tx_hash: parsed.hash,
        })
    }

    #[instrument(skip(self))]
    async fn find_payment_by_memo(&self, memo: &str) -> Result<Option<LedgerReceipt>, AppError> {
        let response = self
            .http_client
            .get(format!("{}/payments", self.base_url))
            .query(&[("memo_hash", memo)])
            .send()
            .await
            .map_err(|e| AppError::Ledger(Self::transport_error(e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AppError::Ledger(LedgerError::InvalidResponse(format!(
                "payment lookup returned {status}"
            ))));
        }

        let page: PaymentPage = response
            .json()
            .await
            .map_err(|e| AppError::Ledger(LedgerError::InvalidResponse(e.to_string())))?;

        Ok(page
            .embedded
            .records
            .into_iter()
            .find(|record| record.transaction_successful)
            .map(|record| LedgerReceipt {
                tx_hash: record.transaction_hash,
            }))
    }
}

/// Parse the platform signing key: base64 of a 32-byte seed or a 64-byte keypair
pub fn signing_key_from_base64(secret: &SecretString) -> Result<SigningKey, AppError> {
    let key_bytes = STANDARD
        .decode(secret.expose_secret().trim())
        .map_err(|e| AppError::Ledger(LedgerError::InvalidSigningKey(e.to_string())))?;

    let seed: [u8; 32] = match key_bytes.len() {
        32 | 64 => key_bytes[..32].try_into().map_err(|_| {
            AppError::Ledger(LedgerError::InvalidSigningKey(
                "Invalid key format".to_string(),
            ))
        })?,
        len => {
            return Err(AppError::Ledger(LedgerError::InvalidSigningKey(format!(
                "expected 32 or 64 bytes, got {len}"
            ))));
        }
    };
    Ok(SigningKey::from_bytes(&seed))
}

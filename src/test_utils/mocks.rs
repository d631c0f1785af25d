//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::domain::{
    AppError, ConfigProvider, DatabaseClient, DatabaseError, FeeSchedule, FeeStatus,
    FeeTransaction, LedgerClient, LedgerError, LedgerReceipt, PaginatedResponse, Promotion,
    RetryPolicy, SettlementError, SettlementPayment, SettlementSettings, TierRates,
    UnknownPromotionPolicy,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// In-memory fee transaction store with version compare-and-swap
pub struct MockDatabaseClient {
    storage: Arc<Mutex<HashMap<String, FeeTransaction>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    fail_updates: AtomicBool,
}

impl MockDatabaseClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(HashMap::new())),
            config,
            is_healthy: AtomicBool::new(true),
            read_delay: Mutex::new(None),
            fail_updates: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Delay every read by id, so concurrent callers observe the same version
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    /// Make every update fail with a query error
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::Relaxed);
    }

    /// Get all stored items (for testing)
    pub fn get_all_items(&self) -> Vec<FeeTransaction> {
        self.storage.lock().unwrap().values().cloned().collect()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MockDatabaseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn insert_fee_transaction(&self, tx: &FeeTransaction) -> Result<FeeTransaction, AppError> {
        self.check_should_fail()?;
        let mut storage = self.storage.lock().unwrap();
        if storage.contains_key(&tx.id) {
            return Err(AppError::Database(DatabaseError::Duplicate(tx.id.clone())));
        }
        if let Some(trade_id) = &tx.trade_id
            && storage
                .values()
                .any(|other| other.trade_id.as_ref() == Some(trade_id))
        {
            return Err(AppError::Database(DatabaseError::Duplicate(format!(
                "trade_id {trade_id}"
            ))));
        }
        storage.insert(tx.id.clone(), tx.clone());
        Ok(tx.clone())
    }

    async fn get_fee_transaction(&self, id: &str) -> Result<Option<FeeTransaction>, AppError> {
        self.check_should_fail()?;
        let snapshot = self.storage.lock().unwrap().get(id).cloned();
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn get_fee_transaction_by_trade_id(
        &self,
        trade_id: &str,
    ) -> Result<Option<FeeTransaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        Ok(storage
            .values()
            .find(|tx| tx.trade_id.as_deref() == Some(trade_id))
            .cloned())
    }

    async fn update_fee_transaction(&self, tx: &FeeTransaction) -> Result<FeeTransaction, AppError> {
        self.check_should_fail()?;
        if self.fail_updates.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Query(
                "update rejected".to_string(),
            )));
        }
        let mut storage = self.storage.lock().unwrap();
        let stored = storage
            .get_mut(&tx.id)
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(tx.id.clone())))?;
        if stored.version != tx.version {
            return Err(AppError::Settlement(
                SettlementError::ConcurrentModification(tx.id.clone()),
            ));
        }
        let mut next = tx.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_fee_transactions(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<FeeTransaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<FeeTransaction> = storage.values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        // Apply cursor
        let items = if let Some(cursor_id) = cursor {
            let pos = items.iter().position(|i| i.id == cursor_id);
            match pos {
                Some(p) => items.into_iter().skip(p + 1).collect(),
                None => {
                    return Err(AppError::Validation(
                        crate::domain::ValidationError::InvalidField {
                            field: "cursor".to_string(),
                            message: "Invalid cursor".to_string(),
                        },
                    ));
                }
            }
        } else {
            items
        };

        let limit = limit.clamp(1, 100) as usize;
        let has_more = items.len() > limit;
        let items: Vec<FeeTransaction> = items.into_iter().take(limit).collect();
        let next_cursor = if has_more {
            items.last().map(|i| i.id.clone())
        } else {
            None
        };

        Ok(PaginatedResponse::new(items, next_cursor, has_more))
    }

    async fn find_by_status(
        &self,
        status: FeeStatus,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<FeeTransaction> = storage
            .values()
            .filter(|tx| tx.status == status && tx.created_at < created_before)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<FeeTransaction> = storage
            .values()
            .filter(|tx| {
                tx.status == FeeStatus::Failed && tx.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        Ok(items.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn find_unchecked_failures(
        &self,
        attempted_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<FeeTransaction> = storage
            .values()
            .filter(|tx| {
                tx.awaiting_ledger_check()
                    && tx.last_attempt_at.is_some_and(|at| at < attempted_before)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.last_attempt_at.cmp(&b.last_attempt_at));
        Ok(items.into_iter().take(limit.max(0) as usize).collect())
    }
}

/// Scriptable ledger: succeeds unless failures are queued
pub struct MockLedgerClient {
    submissions: Arc<Mutex<Vec<SettlementPayment>>>,
    failures: Mutex<VecDeque<(bool, String)>>,
    payments: Mutex<HashMap<String, String>>,
    delay: Mutex<Option<Duration>>,
    memo_lookup: bool,
    is_healthy: AtomicBool,
    counter: AtomicU64,
}

impl MockLedgerClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            submissions: Arc::new(Mutex::new(Vec::new())),
            failures: Mutex::new(VecDeque::new()),
            payments: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            memo_lookup: true,
            is_healthy: AtomicBool::new(true),
            counter: AtomicU64::new(0),
        }
    }

    /// Ledger whose payments cannot be searched by memo
    #[must_use]
    pub fn without_memo_lookup(mut self) -> Self {
        self.memo_lookup = false;
        self
    }

    /// Fail the next submission
    pub fn push_failure(&self, retryable: bool, reason: impl Into<String>) {
        self.failures
            .lock()
            .unwrap()
            .push_back((retryable, reason.into()));
    }

    /// Fail the next `count` submissions
    pub fn push_failures(&self, count: usize, retryable: bool, reason: &str) {
        for _ in 0..count {
            self.push_failure(retryable, reason);
        }
    }

    /// Delay every submission
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Pretend a payment with `memo` is on the ledger
    pub fn record_payment(&self, memo: &str, tx_hash: &str) {
        self.payments
            .lock()
            .unwrap()
            .insert(memo.to_string(), tx_hash.to_string());
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Every submission attempt, including failed ones
    pub fn submissions(&self) -> Vec<SettlementPayment> {
        self.submissions.lock().unwrap().clone()
    }
}

impl Default for MockLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Ledger(LedgerError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        Ok(())
    }

    async fn submit(&self, payment: &SettlementPayment) -> Result<LedgerReceipt, LedgerError> {
        self.submissions.lock().unwrap().push(payment.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((retryable, reason)) = self.failures.lock().unwrap().pop_front() {
            return Err(LedgerError::SubmissionFailed { retryable, reason });
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let tx_hash = format!("mock_hash_{n}");
        self.record_payment(&payment.memo, &tx_hash);
        Ok(LedgerReceipt { tx_hash })
    }

    async fn find_payment_by_memo(&self, memo: &str) -> Result<Option<LedgerReceipt>, AppError> {
        if !self.memo_lookup {
            return Err(AppError::NotSupported(
                "memo lookup disabled".to_string(),
            ));
        }
        Ok(self
            .payments
            .lock()
            .unwrap()
            .get(memo)
            .map(|tx_hash| LedgerReceipt {
                tx_hash: tx_hash.clone(),
            }))
    }
}

/// Settings used by tests: 0.1% standard rate, fast retries, one promotion
#[must_use]
pub fn test_settings() -> SettlementSettings {
    SettlementSettings {
        fee_schedule: FeeSchedule {
            rates: TierRates {
                standard: "0.0010".parse().unwrap(),
                high_volume: "0.0008".parse().unwrap(),
                vip: "0.0005".parse().unwrap(),
            },
            high_volume_threshold: "100000".parse().unwrap(),
            promotions: vec![Promotion {
                code: "LAUNCH".to_string(),
                rate: "0.0001".parse().unwrap(),
                active: true,
                expires_at: None,
            }],
            unknown_promotion: UnknownPromotionPolicy::Reject,
        },
        retry: RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 20,
            backoff_cap_ms: 100,
        },
        platform_wallet: Some("GPLATFORMWALLET".to_string()),
        submission_timeout_ms: 200,
    }
}

/// Replaceable in-memory settings
pub struct MockConfigProvider {
    settings: RwLock<Arc<SettlementSettings>>,
}

impl MockConfigProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    #[must_use]
    pub fn with_settings(settings: SettlementSettings) -> Self {
        Self {
            settings: RwLock::new(Arc::new(settings)),
        }
    }
}

impl Default for MockConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProvider for MockConfigProvider {
    fn settings(&self) -> Arc<SettlementSettings> {
        Arc::clone(&self.settings.read().unwrap())
    }

    fn replace_fee_schedule(&self, schedule: FeeSchedule) -> Result<(), AppError> {
        let mut guard = self.settings.write().unwrap();
        let mut next = (**guard).clone();
        next.fee_schedule = schedule;
        *guard = Arc::new(next);
        Ok(())
    }
}

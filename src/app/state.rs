//! Application state management.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::domain::{ConfigProvider, DatabaseClient, LedgerClient};

use super::queue::{SettlementJob, SettlementQueue};
use super::service::SettlementService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SettlementService>,
    pub db_client: Arc<dyn DatabaseClient>,
    pub ledger_client: Arc<dyn LedgerClient>,
    pub config: Arc<dyn ConfigProvider>,
    /// Token required by the admin endpoints (optional)
    pub admin_token: Option<SecretString>,
}

impl AppState {
    /// Create the state and the job receiver the settlement worker consumes
    #[must_use]
    pub fn new(
        db_client: Arc<dyn DatabaseClient>,
        ledger_client: Arc<dyn LedgerClient>,
        config: Arc<dyn ConfigProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<SettlementJob>) {
        let (queue, jobs) = SettlementQueue::new();
        let service = Arc::new(SettlementService::new(
            Arc::clone(&db_client),
            Arc::clone(&ledger_client),
            Arc::clone(&config),
            Arc::new(queue),
        ));
        let state = Self {
            service,
            db_client,
            ledger_client,
            config,
            admin_token: None,
        };
        (state, jobs)
    }

    /// Require `x-admin-token` on admin endpoints (builder pattern)
    #[must_use]
    pub fn with_admin_token(mut self, token: SecretString) -> Self {
        self.admin_token = Some(token);
        self
    }
}

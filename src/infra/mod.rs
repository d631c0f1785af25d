//! Infrastructure layer implementations.

pub mod config;
pub mod database;
pub mod ledger;

pub use config::{InMemoryConfigProvider, settings_from_env};
pub use database::{PostgresClient, PostgresConfig};
pub use ledger::{HorizonLedgerClient, LedgerClientConfig, signing_key_from_base64};

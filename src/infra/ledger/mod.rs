//! Settlement ledger integrations.

pub mod horizon;

pub use horizon::{HorizonLedgerClient, LedgerClientConfig, signing_key_from_base64};

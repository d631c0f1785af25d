//! Fee computation and ledger settlement service.
//!
//! Layers:
//! - [`domain`]: money arithmetic, fee policy, the fee transaction state machine,
//!   error taxonomy and collaborator contracts
//! - [`app`]: the settlement coordinator, retry queue and background workers
//! - [`infra`]: PostgreSQL persistence, ledger gateway client, configuration
//! - [`api`]: thin HTTP surface over the coordinator

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

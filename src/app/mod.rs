//! Application layer containing business logic and shared state.

pub mod crank;
pub mod queue;
pub mod service;
pub mod state;
pub mod worker;

pub use crank::{CrankConfig, StaleTransactionCrank, spawn_crank};
pub use queue::{SettlementJob, SettlementQueue};
pub use service::{ReconcileOutcome, SettlementService};
pub use state::AppState;
pub use worker::{SettlementWorker, WorkerConfig, spawn_worker};

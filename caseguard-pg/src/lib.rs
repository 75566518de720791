//! caseguard PostgreSQL Backend
//!
//! Production implementations of the runner's collaborators:
//! - `PgLockBackend`: session-level advisory locks on pinned pooled connections
//! - `PgRunStore`: the `agent_runs` table
//! - Schema migration, tracing setup, and the `caseguard-admin` operator binary

pub mod db;
pub mod lock_backend;
pub mod run_store;
pub mod schema;
pub mod telemetry;

pub use db::{DbClient, DbConfig, DbPools};
pub use lock_backend::{PgLockBackend, PgLockSession};
pub use run_store::PgRunStore;
pub use schema::migrate;
pub use telemetry::{init_tracing, TelemetryConfig};

use caseguard_core::{CaseGuardConfig, CaseGuardResult};
use caseguard_runner::RunOrchestrator;
use std::sync::Arc;

/// Orchestrator wired to Postgres for both run records and case locks.
///
/// Run records go through `pools.runs` and lock sessions through
/// `pools.locks`, so a caller holding a lock can always reach the store.
pub fn orchestrator(pools: &DbPools, config: CaseGuardConfig) -> CaseGuardResult<RunOrchestrator> {
    RunOrchestrator::new(
        Arc::new(PgRunStore::new(pools.runs.clone())),
        Arc::new(PgLockBackend::new(pools.locks.clone())),
        config,
    )
}

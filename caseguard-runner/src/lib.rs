//! caseguard Runner - Case-Level Mutual Exclusion
//!
//! Guarantees that at most one agent run works on a case at a time:
//! - Non-blocking case locks pinned to one backend session
//! - Skip-on-contention orchestration with an auditable run record
//! - Lock probe and operator force-unlock
//! - Lifecycle events through a pluggable sink

pub mod events;
pub mod manager;
pub mod orchestrator;
pub mod output;

pub use events::TracingEventSink;
pub use manager::{CaseLockGuard, LockAttempt, LockManager};
pub use orchestrator::{RunOrchestrator, RunOutcome};
pub use output::{Proposal, RunOutput};

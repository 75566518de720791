//! Lifecycle events emitted by the run orchestrator.
//!
//! Three transitions are observable: a run was skipped because the case was
//! locked, a run acquired the lock, and a run reached a terminal status.
//! Sinks are observers only; they cannot influence the run.

use crate::{CaseId, LockKey, ProposalId, RunId, RunStatus, TriggerType};
use serde::{Deserialize, Serialize};

/// A run lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Skipped {
        run_id: RunId,
        case_id: CaseId,
        trigger_type: TriggerType,
        lock_key: LockKey,
        reason: String,
    },
    LockAcquired {
        run_id: RunId,
        case_id: CaseId,
        trigger_type: TriggerType,
        lock_key: LockKey,
    },
    Finished {
        run_id: RunId,
        case_id: CaseId,
        trigger_type: TriggerType,
        status: RunStatus,
        proposal_id: Option<ProposalId>,
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::Skipped { run_id, .. }
            | RunEvent::LockAcquired { run_id, .. }
            | RunEvent::Finished { run_id, .. } => *run_id,
        }
    }

    pub fn case_id(&self) -> CaseId {
        match self {
            RunEvent::Skipped { case_id, .. }
            | RunEvent::LockAcquired { case_id, .. }
            | RunEvent::Finished { case_id, .. } => *case_id,
        }
    }

    /// Short name, stable for log fields and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Skipped { .. } => "skipped",
            RunEvent::LockAcquired { .. } => "lock_acquired",
            RunEvent::Finished { .. } => "finished",
        }
    }
}

/// Receiver of run lifecycle events.
pub trait RunEventSink: Send + Sync {
    fn emit(&self, event: &RunEvent);
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl RunEventSink for NoopEventSink {
    fn emit(&self, _event: &RunEvent) {}
}

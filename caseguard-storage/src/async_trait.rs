//! Async traits for the two backends the runner coordinates through.
//!
//! Both are external collaborators: a relational store for run records and
//! the database's session-scoped advisory lock facility. Every method is one
//! round trip and may suspend.

use ::async_trait::async_trait;
use caseguard_core::{
    AgentRun, CaseGuardResult, CaseId, LockError, LockKey, ProposalId, RunId, RunMetadata,
    TriggerType,
};

/// Persistence for agent run records.
///
/// Implementations must reject transitions that the run state machine does
/// not allow (`StorageError::InvalidTransition`), so a terminal record can
/// never be rewritten.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run with status `pending` and `lock_acquired = false`.
    async fn create_run(
        &self,
        case_id: CaseId,
        trigger_type: TriggerType,
        metadata: RunMetadata,
    ) -> CaseGuardResult<AgentRun>;

    /// `pending -> running`, recording the lock key.
    async fn mark_lock_acquired(&self, run_id: RunId, lock_key: LockKey) -> CaseGuardResult<()>;

    /// `pending -> skipped_locked`, recording the reason.
    async fn mark_skipped(&self, run_id: RunId, reason: &str) -> CaseGuardResult<()>;

    /// `running -> completed` when `error` is `None`, `running -> failed` otherwise.
    async fn mark_completed(
        &self,
        run_id: RunId,
        proposal_id: Option<ProposalId>,
        error: Option<&str>,
    ) -> CaseGuardResult<()>;

    /// Get a run by ID.
    async fn get_run(&self, run_id: RunId) -> CaseGuardResult<Option<AgentRun>>;

    /// List the most recent runs for a case, newest first.
    async fn list_runs_for_case(
        &self,
        case_id: CaseId,
        limit: usize,
    ) -> CaseGuardResult<Vec<AgentRun>>;

    /// List runs still `pending` or `running`, oldest first.
    ///
    /// A run left open after its caller went away stays open for good; this
    /// is how operators find them.
    async fn list_open_runs(&self, limit: usize) -> CaseGuardResult<Vec<AgentRun>>;
}

/// One backend session (for Postgres: one connection).
///
/// Advisory locks belong to the session that took them. A lock taken on one
/// session can only be released on that same session; `release` on any other
/// session reports `false` and leaves the lock held.
#[async_trait]
pub trait LockSession: Send {
    /// Non-blocking exclusive acquire. `Ok(false)` means another session holds it.
    async fn try_acquire(&mut self, key: LockKey) -> Result<bool, LockError>;

    /// Release a lock held by this session. `Ok(false)` if this session did
    /// not hold it.
    async fn release(&mut self, key: LockKey) -> Result<bool, LockError>;

    /// Close the session instead of returning it for reuse. The backend frees
    /// every lock the session still holds.
    fn invalidate(&mut self);

    /// Short label for logs (e.g. backend pid).
    fn label(&self) -> String;
}

/// Source of lock sessions.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Check out a session. The caller keeps it for the whole
    /// acquire/operation/release sequence.
    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError>;

    /// Free `key` whichever session holds it. Returns whether a holder was
    /// found. Not safe while a legitimate holder may still be running.
    async fn force_release(&self, key: LockKey) -> Result<bool, LockError>;
}

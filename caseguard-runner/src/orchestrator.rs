//! Execution orchestrator: runs an operation for a case under its lock.
//!
//! ```text
//! create run (pending)
//!   └─ try-acquire ──┬─ not acquired ─→ mark skipped_locked ─→ return skipped
//!                    └─ acquired ─→ mark running ─→ operation(run_id)
//!                                                     └─ release lock (always)
//!                                                          └─ mark completed / failed ─→ return
//! ```
//!
//! Contention never waits and never retries; the next external trigger
//! decides whether to try again.

use crate::events::TracingEventSink;
use crate::manager::{LockAttempt, LockManager};
use crate::output::RunOutput;
use caseguard_core::{
    CaseGuardConfig, CaseGuardError, CaseGuardResult, CaseId, RunEvent, RunEventSink, RunId,
    RunMetadata, RunStatus, StorageError, TriggerType,
};
use caseguard_storage::{LockBackend, RunStore};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

// ============================================================================
// RUN OUTCOME
// ============================================================================

/// What happened to one `with_lock` call.
///
/// A skipped run and a failed run both have `success == false`; check
/// `skipped` to tell them apart.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome<T> {
    pub run_id: RunId,
    pub success: bool,
    pub skipped: bool,
    /// Operation return value, when it returned normally.
    pub result: Option<T>,
    /// Operation error message (or why the operation was not started).
    pub error: Option<String>,
    /// Backend diagnostic when the lock attempt failed for a reason other
    /// than contention.
    pub lock_diagnostic: Option<String>,
    /// Whether the lock was released cleanly on its own session. Always
    /// `false` for skipped runs.
    pub lock_released: bool,
    /// Run record updates that failed. The run record may lag behind the
    /// outcome when this is non-empty.
    pub record_errors: Vec<String>,
}

impl<T> RunOutcome<T> {
    fn skipped(run_id: RunId, lock_diagnostic: Option<String>, record_errors: Vec<String>) -> Self {
        Self {
            run_id,
            success: false,
            skipped: true,
            result: None,
            error: None,
            lock_diagnostic,
            lock_released: false,
            record_errors,
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Sequences run records and case locks around a caller's operation.
#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<dyn RunStore>,
    locks: LockManager,
    events: Arc<dyn RunEventSink>,
    config: CaseGuardConfig,
}

impl RunOrchestrator {
    /// Create an orchestrator.
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(
        store: Arc<dyn RunStore>,
        backend: Arc<dyn LockBackend>,
        config: CaseGuardConfig,
    ) -> CaseGuardResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            locks: LockManager::new(backend, &config),
            events: Arc::new(TracingEventSink),
            config,
        })
    }

    /// Replace the event sink.
    pub fn with_event_sink(mut self, events: Arc<dyn RunEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn config(&self) -> &CaseGuardConfig {
        &self.config
    }

    /// Advisory contention probe. See [`LockManager::is_locked`].
    pub async fn is_locked(&self, case_id: CaseId) -> CaseGuardResult<bool> {
        self.locks.is_locked(case_id).await
    }

    /// Operator-only forced unlock. See [`LockManager::force_release`].
    pub async fn force_unlock(&self, case_id: CaseId) -> CaseGuardResult<bool> {
        self.locks.force_release(case_id).await
    }

    /// Run `operation` for `case_id` if, and only if, no other run holds the
    /// case lock.
    ///
    /// A run record is created before the lock is tried. If the lock is held
    /// elsewhere (or the lock backend cannot answer) the run is marked
    /// `skipped_locked` and `operation` is never called. Otherwise the run is
    /// marked `running`, `operation(run_id)` is awaited, the lock is released
    /// on the session that took it, and the run is marked `completed` or
    /// `failed`. Errors and panics from `operation` are captured into the
    /// outcome and the run record.
    ///
    /// # Errors
    /// - `Validation` when `case_id` is outside the lock keyspace
    /// - `Storage` when the run record cannot be created (no lock is touched)
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        case_id: CaseId,
        trigger_type: TriggerType,
        metadata: RunMetadata,
        operation: F,
    ) -> CaseGuardResult<RunOutcome<T>>
    where
        F: FnOnce(RunId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: RunOutput,
        E: fmt::Display,
    {
        let lock_key = self.locks.lock_key(case_id)?;

        let run = self
            .timed("create_run", self.store.create_run(case_id, trigger_type, metadata))
            .await?;
        let run_id = run.run_id;

        let guard = match self.locks.try_acquire_key(case_id, lock_key).await {
            LockAttempt::Acquired(guard) => guard,
            attempt => {
                let lock_diagnostic = attempt.diagnostic().map(str::to_string);
                let mut record_errors = Vec::new();
                self.record(
                    run_id,
                    "mark_skipped",
                    self.store.mark_skipped(run_id, &self.config.skip_reason),
                    &mut record_errors,
                )
                .await;
                self.events.emit(&RunEvent::Skipped {
                    run_id,
                    case_id,
                    trigger_type,
                    lock_key,
                    reason: self.config.skip_reason.clone(),
                });
                return Ok(RunOutcome::skipped(run_id, lock_diagnostic, record_errors));
            }
        };

        let mut record_errors = Vec::new();
        let recorded = self
            .record(
                run_id,
                "mark_lock_acquired",
                self.store.mark_lock_acquired(run_id, lock_key),
                &mut record_errors,
            )
            .await;
        if !recorded {
            // Never run work the audit trail cannot account for.
            let lock_released = guard.release().await;
            return Ok(RunOutcome {
                run_id,
                success: false,
                skipped: false,
                result: None,
                error: Some("could not record lock acquisition; operation not started".to_string()),
                lock_diagnostic: None,
                lock_released,
                record_errors,
            });
        }
        self.events.emit(&RunEvent::LockAcquired {
            run_id,
            case_id,
            trigger_type,
            lock_key,
        });

        let invocation = AssertUnwindSafe(async move { operation(run_id).await })
            .catch_unwind()
            .await;

        let lock_released = guard.release().await;

        let (result, error) = match invocation {
            Ok(Ok(value)) => (Some(value), None),
            Ok(Err(err)) => (None, Some(err.to_string())),
            Err(panic) => (
                None,
                Some(format!("operation panicked: {}", panic_message(panic.as_ref()))),
            ),
        };
        let proposal_id = result.as_ref().and_then(|value| value.proposal_id());

        self.record(
            run_id,
            "mark_completed",
            self.store
                .mark_completed(run_id, proposal_id, error.as_deref()),
            &mut record_errors,
        )
        .await;

        let status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.events.emit(&RunEvent::Finished {
            run_id,
            case_id,
            trigger_type,
            status,
            proposal_id,
            error: error.clone(),
        });

        Ok(RunOutcome {
            run_id,
            success: error.is_none(),
            skipped: false,
            result,
            error,
            lock_diagnostic: None,
            lock_released,
            record_errors,
        })
    }

    /// Await a store call with the configured backend timeout.
    async fn timed<T, F>(&self, operation: &str, fut: F) -> CaseGuardResult<T>
    where
        F: Future<Output = CaseGuardResult<T>>,
    {
        match tokio::time::timeout(self.config.backend_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CaseGuardError::Storage(StorageError::Timeout {
                operation: operation.to_string(),
            })),
        }
    }

    /// Run a bookkeeping update; failures are logged and collected, never raised.
    async fn record<F>(
        &self,
        run_id: RunId,
        operation: &str,
        fut: F,
        errors: &mut Vec<String>,
    ) -> bool
    where
        F: Future<Output = CaseGuardResult<()>>,
    {
        match self.timed(operation, fut).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(%run_id, operation, error = %err, "run record update failed");
                errors.push(format!("{}: {}", operation, err));
                false
            }
        }
    }
}

impl fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("locks", &self.locks)
            .field("config", &self.config)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

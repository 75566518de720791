//! Agent run records and their lifecycle.
//!
//! One `AgentRun` is written per processing attempt, before any lock is
//! tried, so contended attempts are auditable too. Records are never deleted.
//!
//! # State Transition Diagram
//!
//! ```text
//! create() → Pending ──┬── mark_skipped() ───────→ SkippedLocked (terminal)
//!                      └── mark_lock_acquired() ─→ Running ──┬── mark_completed(None)  → Completed (terminal)
//!                                                            └── mark_completed(Some) → Failed (terminal)
//! ```

use crate::error::{EntityType, StorageError};
use crate::{new_run_id, CaseId, LockKey, ProposalId, RunId, RunStatus, Timestamp, TriggerType};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Free-form key/value metadata attached to a run.
pub type RunMetadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key under which the skip reason is recorded.
pub const SKIP_REASON_KEY: &str = "skip_reason";

/// Record of one processing attempt for a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: RunId,
    pub case_id: CaseId,
    pub trigger_type: TriggerType,
    pub status: RunStatus,
    /// True iff the try-acquire for this run succeeded.
    pub lock_acquired: bool,
    pub lock_key: Option<LockKey>,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    /// Only set when `status == Failed`.
    pub error: Option<String>,
    pub proposal_id: Option<ProposalId>,
    pub metadata: RunMetadata,
}

impl AgentRun {
    /// Create a pending run.
    pub fn new(case_id: CaseId, trigger_type: TriggerType, metadata: RunMetadata) -> Self {
        Self {
            run_id: new_run_id(),
            case_id,
            trigger_type,
            status: RunStatus::Pending,
            lock_acquired: false,
            lock_key: None,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            proposal_id: None,
            metadata,
        }
    }

    /// Check if the run has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reason recorded when the run was skipped, if any.
    pub fn skip_reason(&self) -> Option<&str> {
        self.metadata.get(SKIP_REASON_KEY).and_then(|v| v.as_str())
    }

    /// Record that the lock was acquired for this run.
    pub fn mark_lock_acquired(&mut self, lock_key: LockKey) -> Result<(), StorageError> {
        self.check_transition(RunStatus::Running)?;
        self.status = RunStatus::Running;
        self.lock_acquired = true;
        self.lock_key = Some(lock_key);
        Ok(())
    }

    /// Record that the lock was held elsewhere. Terminal.
    pub fn mark_skipped(&mut self, reason: &str) -> Result<(), StorageError> {
        self.check_transition(RunStatus::SkippedLocked)?;
        self.status = RunStatus::SkippedLocked;
        self.metadata.insert(
            SKIP_REASON_KEY.to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Record the end of the operation. Terminal.
    ///
    /// The run becomes `Completed` when `error` is `None`, `Failed` otherwise.
    pub fn mark_completed(
        &mut self,
        proposal_id: Option<ProposalId>,
        error: Option<String>,
    ) -> Result<(), StorageError> {
        let next = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.check_transition(next)?;
        self.status = next;
        self.proposal_id = proposal_id;
        self.error = error;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    fn check_transition(&self, next: RunStatus) -> Result<(), StorageError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(StorageError::InvalidTransition {
                run_id: self.run_id,
                from: self.status,
                to: next,
            })
        }
    }

    /// Error for a store lookup that found no run with this id.
    pub fn not_found(run_id: RunId) -> StorageError {
        StorageError::NotFound {
            entity_type: EntityType::AgentRun,
            id: run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pending() -> AgentRun {
        AgentRun::new(CaseId::new(42).unwrap(), TriggerType::Inbound, RunMetadata::new())
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = pending();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(!run.lock_acquired);
        assert!(run.lock_key.is_none());
        assert!(run.ended_at.is_none());
    }

    #[test]
    fn test_skip_records_reason() {
        let mut run = pending();
        run.mark_skipped("held elsewhere").unwrap();
        assert_eq!(run.status, RunStatus::SkippedLocked);
        assert_eq!(run.skip_reason(), Some("held elsewhere"));
        assert!(!run.lock_acquired);
        assert!(run.error.is_none());
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_success_path() {
        let mut run = pending();
        run.mark_lock_acquired(LockKey::from_raw(99)).unwrap();
        assert!(run.lock_acquired);
        assert_eq!(run.status, RunStatus::Running);

        run.mark_completed(Some(42), None).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.proposal_id, Some(42));
        assert!(run.error.is_none());
    }

    #[test]
    fn test_error_makes_run_failed() {
        let mut run = pending();
        run.mark_lock_acquired(LockKey::from_raw(99)).unwrap();
        run.mark_completed(None, Some("boom".to_string())).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_complete_requires_lock() {
        let mut run = pending();
        let err = run.mark_completed(None, None).unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTransition {
                from: RunStatus::Pending,
                to: RunStatus::Completed,
                ..
            }
        ));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Acquire,
        Skip,
        Complete,
        Fail,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Acquire),
            Just(Step::Skip),
            Just(Step::Complete),
            Just(Step::Fail),
        ]
    }

    proptest! {
        /// Whatever order transitions are attempted in, a terminal run never
        /// changes again and the record invariants hold after every step.
        #[test]
        fn prop_terminal_runs_are_frozen(steps in prop::collection::vec(step(), 1..8)) {
            let mut run = pending();
            for step in steps {
                let before = run.clone();
                let result = match step {
                    Step::Acquire => run.mark_lock_acquired(LockKey::from_raw(1)),
                    Step::Skip => run.mark_skipped("busy"),
                    Step::Complete => run.mark_completed(Some(7), None),
                    Step::Fail => run.mark_completed(None, Some("err".to_string())),
                };
                if before.is_terminal() {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(&run, &before);
                }
                if result.is_err() {
                    prop_assert_eq!(&run, &before);
                }
                prop_assert_eq!(run.error.is_some(), run.status == RunStatus::Failed);
                prop_assert_eq!(
                    run.lock_acquired,
                    matches!(run.status, RunStatus::Running | RunStatus::Completed | RunStatus::Failed)
                );
            }
        }
    }
}

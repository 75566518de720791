//! Default run event sink backed by `tracing`.

use caseguard_core::{RunEvent, RunEventSink, RunStatus};

/// Logs each lifecycle event with structured fields under the
/// `caseguard::runs` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl RunEventSink for TracingEventSink {
    fn emit(&self, event: &RunEvent) {
        match event {
            RunEvent::Skipped {
                run_id,
                case_id,
                trigger_type,
                lock_key,
                reason,
            } => {
                tracing::info!(
                    target: "caseguard::runs",
                    event = event.kind(),
                    %run_id,
                    %case_id,
                    trigger = %trigger_type,
                    %lock_key,
                    reason = %reason,
                    "run skipped: case locked"
                );
            }
            RunEvent::LockAcquired {
                run_id,
                case_id,
                trigger_type,
                lock_key,
            } => {
                tracing::info!(
                    target: "caseguard::runs",
                    event = event.kind(),
                    %run_id,
                    %case_id,
                    trigger = %trigger_type,
                    %lock_key,
                    "run acquired case lock"
                );
            }
            RunEvent::Finished {
                run_id,
                case_id,
                trigger_type,
                status,
                proposal_id,
                error,
            } => {
                if *status == RunStatus::Failed {
                    tracing::warn!(
                        target: "caseguard::runs",
                        event = event.kind(),
                        %run_id,
                        %case_id,
                        trigger = %trigger_type,
                        %status,
                        error = error.as_deref().unwrap_or(""),
                        "run failed"
                    );
                } else {
                    tracing::info!(
                        target: "caseguard::runs",
                        event = event.kind(),
                        %run_id,
                        %case_id,
                        trigger = %trigger_type,
                        %status,
                        proposal_id = ?proposal_id,
                        "run completed"
                    );
                }
            }
        }
    }
}

//! Enum types for case runs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// TRIGGER TYPE
// ============================================================================

/// What caused a processing attempt to be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// An inbound event (webhook, reply) arrived for the case
    Inbound,
    /// Scheduled follow-up sweep
    CronFollowup,
    /// Resumption of previously paused work
    Resume,
    /// Operator-initiated retry
    Manual,
}

impl TriggerType {
    /// All trigger types, in declaration order.
    pub const ALL: [TriggerType; 4] = [
        TriggerType::Inbound,
        TriggerType::CronFollowup,
        TriggerType::Resume,
        TriggerType::Manual,
    ];

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TriggerType::Inbound => "inbound",
            TriggerType::CronFollowup => "cron_followup",
            TriggerType::Resume => "resume",
            TriggerType::Manual => "manual",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, TriggerTypeParseError> {
        match s {
            "inbound" => Ok(TriggerType::Inbound),
            "cron_followup" => Ok(TriggerType::CronFollowup),
            "resume" => Ok(TriggerType::Resume),
            "manual" => Ok(TriggerType::Manual),
            _ => Err(TriggerTypeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for TriggerType {
    type Err = TriggerTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid trigger type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerTypeParseError(pub String);

impl fmt::Display for TriggerTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid trigger type: {}", self.0)
    }
}

impl std::error::Error for TriggerTypeParseError {}

// ============================================================================
// RUN STATUS
// ============================================================================

/// Status of an agent run.
///
/// ```text
/// Pending ──┬── skip() ─────→ SkippedLocked (terminal)
///           └── acquire() ──→ Running ──┬── complete() → Completed (terminal)
///                                       └── fail() ────→ Failed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Record created, lock not yet attempted
    Pending,
    /// Lock held, operation in flight
    Running,
    /// Another run held the lock; operation never invoked
    SkippedLocked,
    /// Operation returned normally
    Completed,
    /// Operation raised an error
    Failed,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::SkippedLocked,
        RunStatus::Completed,
        RunStatus::Failed,
    ];

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::SkippedLocked => "skipped_locked",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, RunStatusParseError> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "skipped_locked" => Ok(RunStatus::SkippedLocked),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(RunStatusParseError(s.to_string())),
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::SkippedLocked | RunStatus::Completed | RunStatus::Failed
        )
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::SkippedLocked)
                | (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid run status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid run status: {}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

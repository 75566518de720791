//! Identity types for caseguard entities

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Run identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making run ids naturally sortable by start time.
pub type RunId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Correlation id of the result a run produced (e.g. a follow-up proposal row).
pub type ProposalId = i64;

/// Generate a new UUIDv7 RunId (timestamp-sortable).
pub fn new_run_id() -> RunId {
    Uuid::now_v7()
}

/// Identifier of an externally owned case.
///
/// Only non-negative integers are valid. The upper bound depends on the lock
/// keyspace in use and is checked by [`crate::LockKeyspace::derive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct CaseId(i64);

impl CaseId {
    /// Create a case id, rejecting negative values.
    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if value < 0 {
            return Err(ValidationError::InvalidValue {
                field: "case_id".to_string(),
                reason: format!("must be non-negative, got {}", value),
            });
        }
        Ok(Self(value))
    }

    /// Raw integer value.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for CaseId {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CaseId> for i64 {
    fn from(id: CaseId) -> Self {
        id.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CaseId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().parse::<i64>().map_err(|e| ValidationError::InvalidValue {
            field: "case_id".to_string(),
            reason: format!("not an integer ({}): {}", e, s),
        })?;
        Self::new(value)
    }
}

//! Error types for caseguard operations

use crate::{CaseId, RunId, RunStatus};
use thiserror::Error;

/// Entity type discriminator used in storage error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    AgentRun,
    CaseLock,
}

/// Run record storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: RunId },

    #[error("Insert failed for {entity_type:?}: {reason}")]
    InsertFailed { entity_type: EntityType, reason: String },

    #[error("Update failed for {entity_type:?} with id {id}: {reason}")]
    UpdateFailed {
        entity_type: EntityType,
        id: RunId,
        reason: String,
    },

    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Storage backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Storage operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Errors from the session-scoped lock backend.
///
/// None of these surface past the lock manager as failures: acquire errors
/// are reported as "not acquired", release errors are logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Lock operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Lock session is closed")]
    SessionClosed,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Case id {case_id} is outside the lock keyspace (must be < {scale})")]
    CaseIdOutOfRange { case_id: CaseId, scale: i64 },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Lock keyspace overflows i64: namespace {namespace} * scale {scale}")]
    KeyspaceOverflow { namespace: i64, scale: i64 },
}

/// Master error type for all caseguard errors.
#[derive(Debug, Clone, Error)]
pub enum CaseGuardError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for caseguard operations.
pub type CaseGuardResult<T> = Result<T, CaseGuardError>;

// =============================================================================
// TESTS
// =============================================================================

//! caseguard Core - Entity Types
//!
//! Pure data structures shared by every other crate: identities, the run
//! record and its state machine, lock key derivation, lifecycle events,
//! errors and configuration. No I/O lives here.

pub mod config;
pub mod enums;
pub mod error;
pub mod event;
pub mod identity;
pub mod lock;
pub mod run;

pub use config::{CaseGuardConfig, DEFAULT_BACKEND_TIMEOUT_MS, DEFAULT_SKIP_REASON};
pub use enums::{RunStatus, RunStatusParseError, TriggerType, TriggerTypeParseError};
pub use error::{
    CaseGuardError, CaseGuardResult, ConfigError, EntityType, LockError, StorageError,
    ValidationError,
};
pub use event::{NoopEventSink, RunEvent, RunEventSink};
pub use identity::{new_run_id, CaseId, ProposalId, RunId, Timestamp};
pub use lock::{
    derive_lock_key, LockKey, LockKeyspace, DEFAULT_LOCK_NAMESPACE, DEFAULT_LOCK_SCALE,
};
pub use run::{AgentRun, RunMetadata, SKIP_REASON_KEY};

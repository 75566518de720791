//! Lock manager over a session-scoped advisory lock backend.
//!
//! Acquire and release for one case always run on the same backend session:
//! a successful acquire hands back a [`CaseLockGuard`] that owns the session
//! until `release` consumes it.
//!
//! ```text
//! try_acquire() ──┬──→ Acquired(guard) ─── guard.release() ──→ (unlocked, session reusable)
//!                 │                    └── drop(guard) ──────→ (session closed, lock freed)
//!                 ├──→ Contended
//!                 └──→ Unavailable     (backend error or timeout; treated as contended)
//! ```

use caseguard_core::{
    CaseGuardConfig, CaseGuardResult, CaseId, LockError, LockKey, LockKeyspace, ValidationError,
};
use caseguard_storage::{LockBackend, LockSession};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// LOCK ATTEMPT
// ============================================================================

/// Result of a non-blocking acquire.
pub enum LockAttempt {
    /// This caller now holds the lock.
    Acquired(CaseLockGuard),
    /// Another session holds the lock.
    Contended { lock_key: LockKey },
    /// The backend could not be reached or did not answer in time. Callers
    /// must treat this exactly like `Contended`.
    Unavailable { lock_key: LockKey, diagnostic: String },
}

impl LockAttempt {
    pub fn acquired(&self) -> bool {
        matches!(self, LockAttempt::Acquired(_))
    }

    pub fn lock_key(&self) -> LockKey {
        match self {
            LockAttempt::Acquired(guard) => guard.lock_key(),
            LockAttempt::Contended { lock_key } | LockAttempt::Unavailable { lock_key, .. } => {
                *lock_key
            }
        }
    }

    /// Backend diagnostic when the attempt failed for a reason other than contention.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            LockAttempt::Unavailable { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

impl fmt::Debug for LockAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockAttempt::Acquired(guard) => f.debug_tuple("Acquired").field(guard).finish(),
            LockAttempt::Contended { lock_key } => f
                .debug_struct("Contended")
                .field("lock_key", lock_key)
                .finish(),
            LockAttempt::Unavailable {
                lock_key,
                diagnostic,
            } => f
                .debug_struct("Unavailable")
                .field("lock_key", lock_key)
                .field("diagnostic", diagnostic)
                .finish(),
        }
    }
}

// ============================================================================
// LOCK GUARD
// ============================================================================

/// A held case lock together with the session that holds it.
///
/// Release with [`CaseLockGuard::release`]. Dropping the guard instead (panic
/// unwinding, future cancellation) closes the session, which makes the
/// backend free the lock rather than leaving it attached to a pooled
/// connection.
pub struct CaseLockGuard {
    case_id: CaseId,
    lock_key: LockKey,
    session: Option<Box<dyn LockSession>>,
    timeout: Duration,
}

impl CaseLockGuard {
    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    pub fn lock_key(&self) -> LockKey {
        self.lock_key
    }

    /// Release the lock on the session that acquired it.
    ///
    /// Returns whether the backend reported the lock as held and released.
    /// Failures are logged, never escalated: whatever ran under the lock has
    /// already finished.
    pub async fn release(mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        let label = session.label();
        let released = tokio::time::timeout(self.timeout, session.release(self.lock_key)).await;
        match released {
            Ok(Ok(true)) => {
                tracing::debug!(case_id = %self.case_id, lock_key = %self.lock_key, session = %label, "case lock released");
                true
            }
            Ok(Ok(false)) => {
                tracing::warn!(
                    case_id = %self.case_id,
                    lock_key = %self.lock_key,
                    session = %label,
                    "case lock was not held by this session at release"
                );
                false
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    case_id = %self.case_id,
                    lock_key = %self.lock_key,
                    session = %label,
                    error = %err,
                    "case lock release failed; closing session"
                );
                session.invalidate();
                false
            }
            Err(_) => {
                tracing::warn!(
                    case_id = %self.case_id,
                    lock_key = %self.lock_key,
                    session = %label,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "case lock release timed out; closing session"
                );
                session.invalidate();
                false
            }
        }
    }
}

impl Drop for CaseLockGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            tracing::warn!(
                case_id = %self.case_id,
                lock_key = %self.lock_key,
                session = %session.label(),
                "case lock guard dropped while held; closing session"
            );
            session.invalidate();
        }
    }
}

impl fmt::Debug for CaseLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseLockGuard")
            .field("case_id", &self.case_id)
            .field("lock_key", &self.lock_key)
            .field("held", &self.session.is_some())
            .finish()
    }
}

// ============================================================================
// LOCK MANAGER
// ============================================================================

/// Non-blocking case lock operations.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    keyspace: LockKeyspace,
    timeout: Duration,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: &CaseGuardConfig) -> Self {
        Self {
            backend,
            keyspace: config.keyspace,
            timeout: config.backend_timeout,
        }
    }

    /// Derive the lock key for a case in this manager's keyspace.
    pub fn lock_key(&self, case_id: CaseId) -> Result<LockKey, ValidationError> {
        self.keyspace.derive(case_id)
    }

    /// Try to take the case lock without waiting.
    ///
    /// # Errors
    ///
    /// Only an out-of-range case id is an error. Contention and backend
    /// failures are reported through [`LockAttempt`].
    pub async fn try_acquire(&self, case_id: CaseId) -> CaseGuardResult<LockAttempt> {
        let lock_key = self.lock_key(case_id)?;
        Ok(self.try_acquire_key(case_id, lock_key).await)
    }

    pub(crate) async fn try_acquire_key(&self, case_id: CaseId, lock_key: LockKey) -> LockAttempt {
        let mut session = match self.open_session().await {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(case_id = %case_id, lock_key = %lock_key, error = %err, "lock backend unavailable");
                return LockAttempt::Unavailable {
                    lock_key,
                    diagnostic: err.to_string(),
                };
            }
        };

        let acquired = with_timeout(self.timeout, "try_acquire", session.try_acquire(lock_key)).await;
        match acquired {
            Ok(true) => {
                tracing::debug!(case_id = %case_id, lock_key = %lock_key, session = %session.label(), "case lock acquired");
                LockAttempt::Acquired(CaseLockGuard {
                    case_id,
                    lock_key,
                    session: Some(session),
                    timeout: self.timeout,
                })
            }
            Ok(false) => {
                tracing::debug!(case_id = %case_id, lock_key = %lock_key, "case lock held elsewhere");
                LockAttempt::Contended { lock_key }
            }
            Err(err) => {
                // The grant may have happened with the reply lost; closing the
                // session guarantees nothing stays held.
                session.invalidate();
                tracing::error!(case_id = %case_id, lock_key = %lock_key, error = %err, "case lock acquire failed; treating as contended");
                LockAttempt::Unavailable {
                    lock_key,
                    diagnostic: err.to_string(),
                }
            }
        }
    }

    /// Point-in-time contention probe.
    ///
    /// Acquires and immediately releases on one session. The answer may be
    /// stale by the time the caller reads it, and the probe itself briefly
    /// holds the lock. Backend failures report `true` (locked).
    pub async fn is_locked(&self, case_id: CaseId) -> CaseGuardResult<bool> {
        let lock_key = self.lock_key(case_id)?;
        match self.try_acquire_key(case_id, lock_key).await {
            LockAttempt::Acquired(guard) => {
                guard.release().await;
                Ok(false)
            }
            LockAttempt::Contended { .. } => Ok(true),
            LockAttempt::Unavailable { diagnostic, .. } => {
                tracing::warn!(case_id = %case_id, diagnostic = %diagnostic, "lock probe failed; reporting locked");
                Ok(true)
            }
        }
    }

    /// Operator recovery: free the case lock whichever session holds it.
    ///
    /// Not safe while a legitimate holder may still be running; it cannot
    /// tell an orphaned lock from a slow one. Backend failures are logged and
    /// reported as `false`.
    pub async fn force_release(&self, case_id: CaseId) -> CaseGuardResult<bool> {
        let lock_key = self.lock_key(case_id)?;
        let released =
            with_timeout(self.timeout, "force_release", self.backend.force_release(lock_key)).await;
        match released {
            Ok(true) => {
                tracing::warn!(case_id = %case_id, lock_key = %lock_key, "case lock force-released");
                Ok(true)
            }
            Ok(false) => {
                tracing::info!(case_id = %case_id, lock_key = %lock_key, "force release found no holder");
                Ok(false)
            }
            Err(err) => {
                tracing::error!(case_id = %case_id, lock_key = %lock_key, error = %err, "force release failed");
                Ok(false)
            }
        }
    }

    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
        with_timeout(self.timeout, "open_session", self.backend.open_session()).await
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("keyspace", &self.keyspace)
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T, LockError>
where
    F: Future<Output = Result<T, LockError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LockError::Timeout {
            operation: operation.to_string(),
        }),
    }
}

//! caseguard Storage - Backend Traits and In-Memory Implementations
//!
//! Defines the run record store and session lock abstractions. The Postgres
//! implementations live in caseguard-pg.

pub mod async_trait;

pub use crate::async_trait::{LockBackend, LockSession, RunStore};

use ::async_trait::async_trait;
use caseguard_core::{
    AgentRun, CaseGuardResult, CaseId, LockError, LockKey, ProposalId, RunId,
    RunMetadata, StorageError, TriggerType,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

// ============================================================================
// MOCK RUN STORE
// ============================================================================

/// In-memory run record store for testing.
#[derive(Debug, Default, Clone)]
pub struct MockRunStore {
    runs: Arc<RwLock<HashMap<RunId, AgentRun>>>,
}

impl MockRunStore {
    /// Create a new mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get count of stored runs.
    pub fn run_count(&self) -> usize {
        self.runs.read().map(|runs| runs.len()).unwrap_or(0)
    }

    /// Snapshot of every stored run, oldest first.
    pub fn all_runs(&self) -> Vec<AgentRun> {
        let mut runs: Vec<AgentRun> = match self.runs.read() {
            Ok(runs) => runs.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        runs.sort_by_key(|r| (r.started_at, r.run_id));
        runs
    }

    fn update<F>(&self, run_id: RunId, f: F) -> CaseGuardResult<()>
    where
        F: FnOnce(&mut AgentRun) -> Result<(), StorageError>,
    {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        let run = runs.get_mut(&run_id).ok_or_else(|| AgentRun::not_found(run_id))?;
        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut next = run.clone();
        f(&mut next)?;
        *run = next;
        Ok(())
    }
}

#[async_trait]
impl RunStore for MockRunStore {
    async fn create_run(
        &self,
        case_id: CaseId,
        trigger_type: TriggerType,
        metadata: RunMetadata,
    ) -> CaseGuardResult<AgentRun> {
        let run = AgentRun::new(case_id, trigger_type, metadata);
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        runs.insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn mark_lock_acquired(&self, run_id: RunId, lock_key: LockKey) -> CaseGuardResult<()> {
        self.update(run_id, |run| run.mark_lock_acquired(lock_key))
    }

    async fn mark_skipped(&self, run_id: RunId, reason: &str) -> CaseGuardResult<()> {
        self.update(run_id, |run| run.mark_skipped(reason))
    }

    async fn mark_completed(
        &self,
        run_id: RunId,
        proposal_id: Option<ProposalId>,
        error: Option<&str>,
    ) -> CaseGuardResult<()> {
        self.update(run_id, |run| {
            run.mark_completed(proposal_id, error.map(str::to_string))
        })
    }

    async fn get_run(&self, run_id: RunId) -> CaseGuardResult<Option<AgentRun>> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(runs.get(&run_id).cloned())
    }

    async fn list_runs_for_case(
        &self,
        case_id: CaseId,
        limit: usize,
    ) -> CaseGuardResult<Vec<AgentRun>> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut matching: Vec<AgentRun> = runs
            .values()
            .filter(|r| r.case_id == case_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.started_at, b.run_id).cmp(&(a.started_at, a.run_id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_open_runs(&self, limit: usize) -> CaseGuardResult<Vec<AgentRun>> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut open: Vec<AgentRun> = runs
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|r| (r.started_at, r.run_id));
        open.truncate(limit);
        Ok(open)
    }
}

// ============================================================================
// IN-MEMORY LOCK BACKEND
// ============================================================================

type SessionId = u64;

#[derive(Debug, Default)]
struct LockTable {
    /// key -> (holding session, re-entrant acquire count)
    holders: HashMap<i64, (SessionId, u32)>,
    /// Sessions killed by `force_release`.
    terminated: HashSet<SessionId>,
    next_session: SessionId,
}

impl LockTable {
    fn drop_session_locks(&mut self, session: SessionId) -> usize {
        let before = self.holders.len();
        self.holders.retain(|_, (holder, _)| *holder != session);
        before - self.holders.len()
    }
}

/// In-memory model of a database's session-scoped advisory locks.
///
/// Behaves like Postgres session locks behind a connection pool:
/// - acquire is non-blocking and re-entrant per session;
/// - release on a session that does not hold the key is a no-op (`false`);
/// - dropping a session without invalidating it models returning the
///   connection to a pool: its locks stay held;
/// - invalidating a session models closing the connection: its locks are freed.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLockBackend {
    table: Arc<Mutex<LockTable>>,
}

impl InMemoryLockBackend {
    /// Create a new backend with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a concrete session (test helper; same as `open_session`).
    pub fn session(&self) -> InMemoryLockSession {
        let id = {
            let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
            table.next_session += 1;
            table.next_session
        };
        InMemoryLockSession {
            id,
            table: Arc::clone(&self.table),
            closed: false,
        }
    }

    /// Whether any session currently holds `key`.
    pub fn is_held(&self, key: LockKey) -> bool {
        self.table
            .lock()
            .map(|t| t.holders.contains_key(&key.as_i64()))
            .unwrap_or(false)
    }

    /// Number of keys currently held across all sessions.
    pub fn held_count(&self) -> usize {
        self.table.lock().map(|t| t.holders.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
        Ok(Box::new(self.session()))
    }

    async fn force_release(&self, key: LockKey) -> Result<bool, LockError> {
        let mut table = lock_table(&self.table)?;
        match table.holders.get(&key.as_i64()).map(|(holder, _)| *holder) {
            Some(holder) => {
                // Terminating the holder frees everything it held.
                table.drop_session_locks(holder);
                table.terminated.insert(holder);
                tracing::warn!(lock_key = %key, session = holder, "terminated lock holder session");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn lock_table(table: &Mutex<LockTable>) -> Result<MutexGuard<'_, LockTable>, LockError> {
    table.lock().map_err(|_| LockError::BackendUnavailable {
        reason: "lock table poisoned".to_string(),
    })
}

/// A session of [`InMemoryLockBackend`].
#[derive(Debug)]
pub struct InMemoryLockSession {
    id: SessionId,
    table: Arc<Mutex<LockTable>>,
    closed: bool,
}

impl InMemoryLockSession {
    fn check_open(&self, table: &LockTable) -> Result<(), LockError> {
        if self.closed || table.terminated.contains(&self.id) {
            return Err(LockError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl LockSession for InMemoryLockSession {
    async fn try_acquire(&mut self, key: LockKey) -> Result<bool, LockError> {
        let mut table = lock_table(&self.table)?;
        self.check_open(&table)?;
        match table.holders.get_mut(&key.as_i64()) {
            None => {
                table.holders.insert(key.as_i64(), (self.id, 1));
                Ok(true)
            }
            Some((holder, count)) if *holder == self.id => {
                *count += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn release(&mut self, key: LockKey) -> Result<bool, LockError> {
        let mut table = lock_table(&self.table)?;
        self.check_open(&table)?;
        let raw = key.as_i64();
        match table.holders.get_mut(&raw) {
            Some((holder, count)) if *holder == self.id => {
                *count -= 1;
                if *count == 0 {
                    table.holders.remove(&raw);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn invalidate(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Ok(mut table) = self.table.lock() {
            let freed = table.drop_session_locks(self.id);
            if freed > 0 {
                tracing::debug!(session = self.id, freed, "closed session released its locks");
            }
        }
    }

    fn label(&self) -> String {
        format!("mem-session-{}", self.id)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use caseguard_core::{derive_lock_key, CaseGuardError, RunStatus};
    use proptest::prelude::*;

    fn case(id: i64) -> CaseId {
        CaseId::new(id).unwrap()
    }

    fn key(id: i64) -> LockKey {
        derive_lock_key(case(id)).unwrap()
    }

    #[tokio::test]
    async fn test_open_runs_exclude_terminal() {
        let store = MockRunStore::new();
        let waiting = store
            .create_run(case(1), TriggerType::Inbound, RunMetadata::new())
            .await
            .unwrap();
        let working = store
            .create_run(case(2), TriggerType::Resume, RunMetadata::new())
            .await
            .unwrap();
        store.mark_lock_acquired(working.run_id, key(2)).await.unwrap();
        let skipped = store
            .create_run(case(3), TriggerType::Manual, RunMetadata::new())
            .await
            .unwrap();
        store.mark_skipped(skipped.run_id, "busy").await.unwrap();

        let open: Vec<RunId> = store
            .list_open_runs(10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(open.len(), 2);
        assert!(open.contains(&waiting.run_id));
        assert!(open.contains(&working.run_id));
        assert_eq!(store.list_open_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_store_full_lifecycle() {
        let store = MockRunStore::new();
        let run = store
            .create_run(case(1), TriggerType::Inbound, RunMetadata::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        store.mark_lock_acquired(run.run_id, key(1)).await.unwrap();
        store.mark_completed(run.run_id, Some(42), None).await.unwrap();

        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.proposal_id, Some(42));
        assert_eq!(stored.lock_key, Some(key(1)));
    }

    #[tokio::test]
    async fn test_run_store_rejects_transition_out_of_terminal() {
        let store = MockRunStore::new();
        let run = store
            .create_run(case(1), TriggerType::Manual, RunMetadata::new())
            .await
            .unwrap();
        store.mark_skipped(run.run_id, "busy").await.unwrap();

        let err = store.mark_lock_acquired(run.run_id, key(1)).await.unwrap_err();
        assert!(matches!(
            err,
            CaseGuardError::Storage(StorageError::InvalidTransition { .. })
        ));
        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::SkippedLocked);
        assert!(!stored.lock_acquired);
    }

    #[tokio::test]
    async fn test_run_store_update_unknown_run() {
        let store = MockRunStore::new();
        let err = store
            .mark_skipped(caseguard_core::new_run_id(), "busy")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaseGuardError::Storage(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_runs_for_case_newest_first() {
        let store = MockRunStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = store
                .create_run(case(5), TriggerType::CronFollowup, RunMetadata::new())
                .await
                .unwrap();
            ids.push(run.run_id);
        }
        store
            .create_run(case(6), TriggerType::CronFollowup, RunMetadata::new())
            .await
            .unwrap();

        let listed = store.list_runs_for_case(case(5), 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.case_id == case(5)));
        assert!(listed[0].started_at >= listed[1].started_at);
        assert_eq!(store.run_count(), 4);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_across_sessions() {
        let backend = InMemoryLockBackend::new();
        let mut a = backend.session();
        let mut b = backend.session();

        assert!(a.try_acquire(key(1)).await.unwrap());
        assert!(!b.try_acquire(key(1)).await.unwrap());
        assert!(b.try_acquire(key(2)).await.unwrap());

        assert!(a.release(key(1)).await.unwrap());
        assert!(b.try_acquire(key(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_on_wrong_session_is_noop() {
        let backend = InMemoryLockBackend::new();
        let mut holder = backend.session();
        let mut other = backend.session();

        assert!(holder.try_acquire(key(9)).await.unwrap());
        assert!(!other.release(key(9)).await.unwrap());
        assert!(backend.is_held(key(9)));
    }

    #[tokio::test]
    async fn test_acquire_is_reentrant_per_session() {
        let backend = InMemoryLockBackend::new();
        let mut session = backend.session();

        assert!(session.try_acquire(key(3)).await.unwrap());
        assert!(session.try_acquire(key(3)).await.unwrap());
        assert!(session.release(key(3)).await.unwrap());
        assert!(backend.is_held(key(3)));
        assert!(session.release(key(3)).await.unwrap());
        assert!(!backend.is_held(key(3)));
    }

    #[tokio::test]
    async fn test_dropped_session_keeps_locks_but_invalidated_frees_them() {
        let backend = InMemoryLockBackend::new();
        {
            let mut pooled = backend.session();
            assert!(pooled.try_acquire(key(4)).await.unwrap());
        }
        assert!(backend.is_held(key(4)));

        let mut closing = backend.session();
        assert!(closing.try_acquire(key(5)).await.unwrap());
        closing.invalidate();
        assert!(!backend.is_held(key(5)));
        assert!(matches!(
            closing.try_acquire(key(5)).await,
            Err(LockError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_force_release_terminates_holder() {
        let backend = InMemoryLockBackend::new();
        let mut holder = backend.session();
        assert!(holder.try_acquire(key(7)).await.unwrap());

        assert!(backend.force_release(key(7)).await.unwrap());
        assert!(!backend.is_held(key(7)));
        assert!(!backend.force_release(key(7)).await.unwrap());
        assert!(matches!(
            holder.release(key(7)).await,
            Err(LockError::SessionClosed)
        ));
    }

    proptest! {
        /// Any interleaving of acquires and releases across sessions keeps
        /// each key with at most one holder, matching a simple model.
        #[test]
        fn prop_lock_table_matches_model(
            ops in prop::collection::vec((0usize..3, 0i64..4, any::<bool>()), 1..64)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let backend = InMemoryLockBackend::new();
                let mut sessions = vec![backend.session(), backend.session(), backend.session()];
                // key -> (holder index, count)
                let mut model: HashMap<i64, (usize, u32)> = HashMap::new();

                for (who, case_id, acquire) in ops {
                    let k = key(case_id);
                    if acquire {
                        let granted = sessions[who].try_acquire(k).await.unwrap();
                        let expected = match model.get_mut(&k.as_i64()) {
                            None => {
                                model.insert(k.as_i64(), (who, 1));
                                true
                            }
                            Some((holder, count)) if *holder == who => {
                                *count += 1;
                                true
                            }
                            Some(_) => false,
                        };
                        prop_assert_eq!(granted, expected);
                    } else {
                        let released = sessions[who].release(k).await.unwrap();
                        let expected = match model.get_mut(&k.as_i64()) {
                            Some((holder, count)) if *holder == who => {
                                *count -= 1;
                                if *count == 0 {
                                    model.remove(&k.as_i64());
                                }
                                true
                            }
                            _ => false,
                        };
                        prop_assert_eq!(released, expected);
                    }
                    prop_assert_eq!(backend.held_count(), model.len());
                }
                Ok(())
            })?;
        }
    }
}

//! caseguard Test Utilities
//!
//! Shared test infrastructure for the caseguard workspace:
//! - Proptest generators for core types
//! - Fault-injecting run store and lock backend
//! - Recording event sink
//! - Fixtures and custom assertions

// Re-export in-memory backends from their source crate
pub use caseguard_storage::{InMemoryLockBackend, InMemoryLockSession, MockRunStore};

pub use caseguard_core::{
    AgentRun, CaseGuardConfig, CaseGuardError, CaseGuardResult, CaseId, EntityType, LockError,
    LockKey, LockKeyspace, ProposalId, RunEvent, RunEventSink, RunId, RunMetadata, RunStatus,
    StorageError, TriggerType,
};

use async_trait::async_trait;
use caseguard_storage::{LockBackend, LockSession, RunStore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// FLAKY RUN STORE
// ============================================================================

#[derive(Debug, Default)]
struct StoreFaults {
    fail_create: AtomicBool,
    fail_mark_lock_acquired: AtomicBool,
    fail_mark_skipped: AtomicBool,
    fail_mark_completed: AtomicBool,
    calls: AtomicUsize,
}

/// Run store wrapper whose individual operations can be made to fail.
#[derive(Debug, Clone, Default)]
pub struct FlakyRunStore {
    inner: MockRunStore,
    faults: Arc<StoreFaults>,
}

impl FlakyRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying store, for inspecting what was actually written.
    pub fn inner(&self) -> &MockRunStore {
        &self.inner
    }

    pub fn fail_create(&self, fail: bool) {
        self.faults.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_lock_acquired(&self, fail: bool) {
        self.faults.fail_mark_lock_acquired.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_skipped(&self, fail: bool) {
        self.faults.fail_mark_skipped.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_completed(&self, fail: bool) {
        self.faults.fail_mark_completed.store(fail, Ordering::SeqCst);
    }

    /// Total calls made against this store, failed ones included.
    pub fn call_count(&self) -> usize {
        self.faults.calls.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, run_id: Option<RunId>, op: &str) -> CaseGuardResult<()> {
        self.faults.calls.fetch_add(1, Ordering::SeqCst);
        if !flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        let reason = format!("injected {} failure", op);
        let err = match run_id {
            Some(id) => StorageError::UpdateFailed {
                entity_type: EntityType::AgentRun,
                id,
                reason,
            },
            None => StorageError::InsertFailed {
                entity_type: EntityType::AgentRun,
                reason,
            },
        };
        Err(err.into())
    }
}

#[async_trait]
impl RunStore for FlakyRunStore {
    async fn create_run(
        &self,
        case_id: CaseId,
        trigger_type: TriggerType,
        metadata: RunMetadata,
    ) -> CaseGuardResult<AgentRun> {
        self.check(&self.faults.fail_create, None, "create_run")?;
        self.inner.create_run(case_id, trigger_type, metadata).await
    }

    async fn mark_lock_acquired(&self, run_id: RunId, lock_key: LockKey) -> CaseGuardResult<()> {
        self.check(
            &self.faults.fail_mark_lock_acquired,
            Some(run_id),
            "mark_lock_acquired",
        )?;
        self.inner.mark_lock_acquired(run_id, lock_key).await
    }

    async fn mark_skipped(&self, run_id: RunId, reason: &str) -> CaseGuardResult<()> {
        self.check(&self.faults.fail_mark_skipped, Some(run_id), "mark_skipped")?;
        self.inner.mark_skipped(run_id, reason).await
    }

    async fn mark_completed(
        &self,
        run_id: RunId,
        proposal_id: Option<ProposalId>,
        error: Option<&str>,
    ) -> CaseGuardResult<()> {
        self.check(&self.faults.fail_mark_completed, Some(run_id), "mark_completed")?;
        self.inner.mark_completed(run_id, proposal_id, error).await
    }

    async fn get_run(&self, run_id: RunId) -> CaseGuardResult<Option<AgentRun>> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs_for_case(
        &self,
        case_id: CaseId,
        limit: usize,
    ) -> CaseGuardResult<Vec<AgentRun>> {
        self.inner.list_runs_for_case(case_id, limit).await
    }

    async fn list_open_runs(&self, limit: usize) -> CaseGuardResult<Vec<AgentRun>> {
        self.inner.list_open_runs(limit).await
    }
}

// ============================================================================
// FAULTY LOCK BACKEND
// ============================================================================

#[derive(Debug, Default)]
struct LockFaults {
    fail_open: AtomicBool,
    lose_acquire_reply: AtomicBool,
    fail_release: AtomicBool,
    fail_force_release: AtomicBool,
    acquire_delay: Mutex<Option<Duration>>,
    invalidated: AtomicUsize,
}

/// Lock backend wrapper over [`InMemoryLockBackend`] with injectable faults.
///
/// `lose_acquire_reply` grants the lock and then reports an error, the way a
/// connection that drops mid-reply would.
#[derive(Debug, Clone, Default)]
pub struct FaultyLockBackend {
    inner: InMemoryLockBackend,
    faults: Arc<LockFaults>,
}

impl FaultyLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing backend so other sessions share its lock table.
    pub fn wrap(inner: InMemoryLockBackend) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    pub fn inner(&self) -> &InMemoryLockBackend {
        &self.inner
    }

    pub fn fail_open(&self, fail: bool) {
        self.faults.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn lose_acquire_reply(&self, lose: bool) {
        self.faults.lose_acquire_reply.store(lose, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.faults.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn fail_force_release(&self, fail: bool) {
        self.faults.fail_force_release.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long before every acquire.
    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.faults.acquire_delay.lock() {
            *slot = delay;
        }
    }

    /// How many sessions have been closed instead of returned.
    pub fn invalidated_sessions(&self) -> usize {
        self.faults.invalidated.load(Ordering::SeqCst)
    }
}

fn unavailable(reason: &str) -> LockError {
    LockError::BackendUnavailable {
        reason: reason.to_string(),
    }
}

#[async_trait]
impl LockBackend for FaultyLockBackend {
    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
        if self.faults.fail_open.load(Ordering::SeqCst) {
            return Err(unavailable("injected connect failure"));
        }
        Ok(Box::new(FaultyLockSession {
            inner: self.inner.session(),
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn force_release(&self, key: LockKey) -> Result<bool, LockError> {
        if self.faults.fail_force_release.load(Ordering::SeqCst) {
            return Err(unavailable("injected force release failure"));
        }
        self.inner.force_release(key).await
    }
}

/// Session handed out by [`FaultyLockBackend`].
#[derive(Debug)]
pub struct FaultyLockSession {
    inner: InMemoryLockSession,
    faults: Arc<LockFaults>,
}

#[async_trait]
impl LockSession for FaultyLockSession {
    async fn try_acquire(&mut self, key: LockKey) -> Result<bool, LockError> {
        let delay = self.faults.acquire_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let granted = self.inner.try_acquire(key).await?;
        if self.faults.lose_acquire_reply.load(Ordering::SeqCst) {
            return Err(unavailable("injected connection reset after acquire"));
        }
        Ok(granted)
    }

    async fn release(&mut self, key: LockKey) -> Result<bool, LockError> {
        if self.faults.fail_release.load(Ordering::SeqCst) {
            return Err(unavailable("injected release failure"));
        }
        self.inner.release(key).await
    }

    fn invalidate(&mut self) {
        self.faults.invalidated.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate();
    }

    fn label(&self) -> String {
        format!("faulty-{}", self.inner.label())
    }
}

// ============================================================================
// RECORDING EVENT SINK
// ============================================================================

/// Event sink that keeps every event for later assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(RunEvent::kind).collect()
    }

    pub fn events_for(&self, run_id: RunId) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.run_id() == run_id)
            .collect()
    }
}

impl RunEventSink for RecordingEventSink {
    fn emit(&self, event: &RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for caseguard types.

    use super::*;
    use proptest::prelude::*;

    /// A case id inside the default keyspace.
    pub fn arb_case_id() -> impl Strategy<Value = CaseId> {
        (0i64..caseguard_core::DEFAULT_LOCK_SCALE)
            .prop_map(|id| CaseId::new(id).unwrap_or_else(|_| unreachable!("non-negative id")))
    }

    pub fn arb_trigger_type() -> impl Strategy<Value = TriggerType> {
        prop::sample::select(TriggerType::ALL.to_vec())
    }

    pub fn arb_run_status() -> impl Strategy<Value = RunStatus> {
        prop::sample::select(RunStatus::ALL.to_vec())
    }

    /// A keyspace that does not overflow `i64`.
    pub fn arb_keyspace() -> impl Strategy<Value = LockKeyspace> {
        (1i64..1_000_000, 1i64..1_000_000_000).prop_filter_map("keyspace overflow", |(ns, scale)| {
            LockKeyspace::new(ns, scale).ok()
        })
    }

    /// Small flat metadata maps of strings, integers and booleans.
    pub fn arb_metadata() -> impl Strategy<Value = RunMetadata> {
        let value = prop_oneof![
            "[a-z0-9 ]{0,16}".prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            any::<bool>().prop_map(serde_json::Value::from),
        ];
        prop::collection::btree_map("[a-z_]{1,12}", value, 0..4)
            .prop_map(|entries| entries.into_iter().collect())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    /// Default config with a short backend timeout so timeout paths run fast.
    pub fn fast_config() -> CaseGuardConfig {
        CaseGuardConfig::default().with_backend_timeout(Duration::from_millis(200))
    }

    pub fn case(id: i64) -> CaseId {
        CaseId::new(id).unwrap_or_else(|e| panic!("fixture case id {}: {}", id, e))
    }

    /// Metadata the way an inbound-message trigger would attach it.
    pub fn inbound_metadata(message_id: &str) -> RunMetadata {
        let mut metadata = RunMetadata::new();
        metadata.insert("message_id".to_string(), message_id.into());
        metadata.insert("channel".to_string(), "email".into());
        metadata
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over run records.

    use super::*;

    #[track_caller]
    pub fn assert_run_status(run: &AgentRun, status: RunStatus) {
        assert_eq!(
            run.status, status,
            "run {} has status {}, expected {}",
            run.run_id, run.status, status
        );
    }

    /// A skipped run never touched the lock and is closed out.
    #[track_caller]
    pub fn assert_skipped(run: &AgentRun) {
        assert_run_status(run, RunStatus::SkippedLocked);
        assert!(!run.lock_acquired, "skipped run {} has lock_acquired", run.run_id);
        assert!(run.skip_reason().is_some(), "skipped run {} has no reason", run.run_id);
        assert!(run.ended_at.is_some());
    }

    /// A completed run held the lock and carries no error.
    #[track_caller]
    pub fn assert_completed(run: &AgentRun, proposal_id: Option<ProposalId>) {
        assert_run_status(run, RunStatus::Completed);
        assert!(run.lock_acquired);
        assert!(run.error.is_none());
        assert_eq!(run.proposal_id, proposal_id);
        assert!(run.ended_at.is_some());
    }

    /// A failed run held the lock and records an error containing `needle`.
    #[track_caller]
    pub fn assert_failed_with(run: &AgentRun, needle: &str) {
        assert_run_status(run, RunStatus::Failed);
        assert!(run.lock_acquired);
        let error = run.error.as_deref().unwrap_or("");
        assert!(
            error.contains(needle),
            "run {} error {:?} does not contain {:?}",
            run.run_id,
            error,
            needle
        );
    }

    /// Count runs with the given status.
    pub fn count_with_status(runs: &[AgentRun], status: RunStatus) -> usize {
        runs.iter().filter(|r| r.status == status).count()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use caseguard_core::derive_lock_key;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_flaky_store_injects_and_recovers() {
        let store = FlakyRunStore::new();
        store.fail_create(true);
        let err = store
            .create_run(fixtures::case(1), TriggerType::Manual, RunMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaseGuardError::Storage(StorageError::InsertFailed { .. })
        ));
        assert_eq!(store.inner().run_count(), 0);

        store.fail_create(false);
        store
            .create_run(fixtures::case(1), TriggerType::Manual, RunMetadata::new())
            .await
            .unwrap();
        assert_eq!(store.inner().run_count(), 1);
        assert_eq!(store.call_count(), 2);
    }

    #[tokio::test]
    async fn test_lost_acquire_reply_leaves_lock_held_until_invalidate() {
        let backend = FaultyLockBackend::new();
        backend.lose_acquire_reply(true);
        let key = derive_lock_key(fixtures::case(2)).unwrap();

        let mut session = backend.open_session().await.unwrap();
        assert!(session.try_acquire(key).await.is_err());
        assert!(backend.inner().is_held(key));

        session.invalidate();
        assert!(!backend.inner().is_held(key));
        assert_eq!(backend.invalidated_sessions(), 1);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let backend = FaultyLockBackend::new();
        backend.fail_open(true);
        assert!(matches!(
            backend.open_session().await,
            Err(LockError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn test_recording_sink_filters_by_run() {
        let sink = RecordingEventSink::new();
        let key = derive_lock_key(fixtures::case(3)).unwrap();
        let a = caseguard_core::new_run_id();
        let b = caseguard_core::new_run_id();
        for run_id in [a, b, a] {
            sink.emit(&RunEvent::LockAcquired {
                run_id,
                case_id: fixtures::case(3),
                trigger_type: TriggerType::Inbound,
                lock_key: key,
            });
        }
        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.events_for(a).len(), 2);
        assert_eq!(sink.kinds(), vec!["lock_acquired"; 3]);
    }

    #[test]
    fn test_inbound_metadata_fixture() {
        let metadata = fixtures::inbound_metadata("msg-1");
        assert_eq!(metadata["message_id"], "msg-1");
    }

    proptest! {
        #[test]
        fn prop_generated_case_ids_have_keys(case_id in generators::arb_case_id()) {
            prop_assert!(derive_lock_key(case_id).is_ok());
        }

        #[test]
        fn prop_generated_keyspaces_accept_case_zero(keyspace in generators::arb_keyspace()) {
            let key = keyspace.derive(fixtures::case(0)).unwrap();
            prop_assert_eq!(key.as_i64(), keyspace.namespace() * keyspace.scale());
        }

        #[test]
        fn prop_generated_metadata_is_small(metadata in generators::arb_metadata()) {
            prop_assert!(metadata.len() < 4);
            prop_assert!(!metadata.contains_key(caseguard_core::SKIP_REASON_KEY));
        }
    }
}

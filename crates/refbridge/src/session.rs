//! # Session Registry
//!
//! The authoritative table of live sessions and the refs each one owns.
//!
//! ## Invariants
//! - **Atomic Lifecycle**: creation and release go through the map's shard
//!   locks; a session is either fully present or fully gone.
//! - **Idempotent Release**: releasing twice is a no-op the second time.
//! - **No Expiry**: sessions end only through their owner or an explicit release.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Instant;

use dashmap::DashMap;
use refwire::Ref;
use refwire::RefId;
use refwire::SessionId;
use tokio::task::AbortHandle;

use crate::error::Error;
use crate::error::Result;
use crate::pool::WorkerId;
use crate::refs::ReferenceTable;
use crate::refs::StaleReason;
use crate::router::AffinityPolicy;

/// A call that timed out and could not be cancelled, still running on `worker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Taint {
    pub worker: WorkerId,
    pub call_id: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    last_worker: Option<WorkerId>,
    default_policy: Option<AffinityPolicy>,
    taint: Option<Taint>,
    refs: ReferenceTable,
}

/// What the router needs to know about a session, read in one lock.
#[derive(Debug, Clone, Copy)]
pub struct RoutingView {
    pub last_worker: Option<WorkerId>,
    pub default_policy: Option<AffinityPolicy>,
    pub taint: Option<Taint>,
}

/// One live session.
///
/// The state mutex is never held across an await point.
pub struct SessionCell {
    id: SessionId,
    created_at: Instant,
    queue: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<SessionState>,
    monitor: Mutex<Option<AbortHandle>>,
}

impl SessionCell {
    fn new(id: SessionId, default_policy: Option<AffinityPolicy>) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            queue: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(SessionState { default_policy, ..Default::default() }),
            monitor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The FIFO queue that serializes `StrictQueue` calls of this session.
    pub fn queue(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.queue.clone()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // A panic while holding the lock cannot leave the state half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn routing_view(&self) -> RoutingView {
        let state = self.state();
        RoutingView {
            last_worker: state.last_worker,
            default_policy: state.default_policy,
            taint: state.taint,
        }
    }

    pub fn last_worker(&self) -> Option<WorkerId> {
        self.state().last_worker
    }

    /// Only successful calls move the session's affinity.
    pub fn record_success(&self, worker: WorkerId) {
        self.state().last_worker = Some(worker);
    }

    pub fn set_default_policy(&self, policy: Option<AffinityPolicy>) {
        self.state().default_policy = policy;
    }

    pub fn taint(&self) -> Option<Taint> {
        self.state().taint
    }

    pub fn set_taint(&self, taint: Taint) {
        self.state().taint = Some(taint);
    }

    /// Clears the taint left by `call_id`. A newer taint is left alone.
    pub fn clear_taint(&self, call_id: u64) -> bool {
        let mut state = self.state();
        match state.taint {
            Some(taint) if taint.call_id == call_id => {
                state.taint = None;
                true
            }
            _ => false,
        }
    }

    /// Records a ref returned by `worker`.
    ///
    /// # Errors
    /// `RefSessionMismatch` if the ref names another session.
    pub fn bind_ref(&self, handle: Ref, worker: WorkerId) -> Result<()> {
        if handle.session_id != self.id {
            return Err(Error::RefSessionMismatch {
                ref_id: handle.id,
                owner: handle.session_id,
                session: self.id.clone(),
            });
        }
        self.state().refs.insert(handle, worker);
        Ok(())
    }

    pub fn check_ref(&self, id: &RefId, routed: WorkerId, worker_independent: bool) -> std::result::Result<(), StaleReason> {
        self.state().refs.check(id, routed, worker_independent)
    }

    pub fn forget_ref(&self, id: &RefId) -> Option<(Ref, WorkerId)> {
        self.state().refs.remove(id).map(|entry| (entry.handle, entry.worker))
    }

    pub fn ref_count(&self) -> usize {
        self.state().refs.len()
    }

    pub fn worker_of(&self, id: &RefId) -> Option<WorkerId> {
        self.state().refs.get(id).map(|entry| entry.worker)
    }

    fn mark_lost(&self, worker: WorkerId) -> usize {
        self.state().refs.mark_lost(worker)
    }

    /// Stores the abort handle of the task watching this session's owner.
    pub fn attach_monitor(&self, handle: AbortHandle) {
        let mut slot = self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handle);
    }

    /// Detaches the owner watch so that it is not aborted by the release it triggers.
    pub fn detach_monitor(&self) -> Option<AbortHandle> {
        self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            id: self.id.clone(),
            last_worker: state.last_worker,
            ref_count: state.refs.len(),
            tainted: state.taint.is_some(),
            created_at: self.created_at,
        }
    }
}

/// A diagnostic snapshot of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub last_worker: Option<WorkerId>,
    pub ref_count: usize,
    pub tainted: bool,
    pub created_at: Instant,
}

/// A session removed from the registry, with the refs its workers must drop.
#[derive(Debug, Clone)]
pub struct ReleasedSession {
    pub session_id: SessionId,
    pub refs_by_worker: BTreeMap<WorkerId, Vec<Ref>>,
}

impl ReleasedSession {
    pub fn ref_count(&self) -> usize {
        self.refs_by_worker.values().map(Vec::len).sum()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionCell>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session with a fresh random id.
    pub fn create(&self, default_policy: Option<AffinityPolicy>) -> Arc<SessionCell> {
        let id = SessionId::new(uuid::Uuid::new_v4().to_string());
        let cell = Arc::new(SessionCell::new(id.clone(), default_policy));
        self.sessions.insert(id.clone(), cell.clone());
        tracing::debug!(session = %id, "session created");
        cell
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<SessionCell>> {
        self.sessions
            .get(id)
            .map(|cell| cell.value().clone())
            .ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    pub fn exists(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Binds a ref to a live session.
    pub fn bind_ref(&self, id: &SessionId, handle: Ref, worker: WorkerId) -> Result<()> {
        self.get(id)?.bind_ref(handle, worker)
    }

    /// Removes the session and drains its refs.
    ///
    /// Returns `None` if the session was already gone. The owner watch, if
    /// still attached, is aborted.
    pub fn release(&self, id: &SessionId) -> Option<ReleasedSession> {
        let (_, cell) = self.sessions.remove(id)?;
        if let Some(monitor) = cell.detach_monitor() {
            monitor.abort();
        }

        let mut refs = std::mem::take(&mut cell.state().refs);
        let released = ReleasedSession {
            session_id: cell.id.clone(),
            refs_by_worker: refs.drain_by_worker(),
        };
        tracing::debug!(session = %id, refs = released.ref_count(), "session released");
        Some(released)
    }

    /// Marks every ref held by `worker` as lost, across all sessions.
    pub fn mark_worker_lost(&self, worker: WorkerId) -> usize {
        self.sessions.iter().map(|entry| entry.value().mark_lost(worker)).sum()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.value().info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

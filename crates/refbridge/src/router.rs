//! # Affinity Router
//!
//! Picks the worker for each call of a session.
//!
//! ## Policies
//!
//! - `StrictQueue`: wait, in FIFO order, for the session's last worker.
//! - `Hint`: prefer the last worker; if it is busy, take any free worker.
//! - `StrictFailFast`: use the last worker or fail immediately with `Busy`.
//!
//! ## Invariants
//! - **One Call Per Worker**: a worker is busy while a `WorkerLease` for it
//!   exists. Acquisition is a single compare-exchange.
//! - **Bounded Waits**: only `StrictQueue` (or a tainted session) ever waits,
//!   and never past the call deadline.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use refwire::SessionId;
use tokio::sync::Notify;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::pool::WorkerId;
use crate::session::RoutingView;
use crate::session::SessionCell;

/// How a call behaves when its session's worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityPolicy {
    #[default]
    StrictQueue,
    Hint,
    StrictFailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no worker available for session {session}")]
    Busy { session: SessionId, worker: Option<WorkerId> },
    #[error("session {session} waited {waited:?} for a worker")]
    DeadlineElapsed { session: SessionId, waited: Duration },
    #[error("the pool has no workers")]
    NoWorkers,
}

pub type Result<T> = std::result::Result<T, RouteError>;

/// Busy flag and wake-up signal of one worker.
pub struct WorkerSlot {
    id: WorkerId,
    busy: AtomicBool,
    freed: Notify,
}

impl WorkerSlot {
    fn new(id: WorkerId) -> Self {
        Self { id, busy: AtomicBool::new(false), freed: Notify::new() }
    }

    fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Exclusive use of one worker. Dropping it frees the worker.
///
/// For `StrictQueue` calls it also holds the session's queue position, so the
/// next queued call of the same session starts only after this one is done.
pub struct WorkerLease {
    slot: Arc<WorkerSlot>,
    any_freed: Arc<Notify>,
    queue: Option<OwnedMutexGuard<()>>,
}

impl WorkerLease {
    pub fn worker(&self) -> WorkerId {
        self.slot.id
    }

    fn with_queue(mut self, queue: Option<OwnedMutexGuard<()>>) -> Self {
        self.queue = queue;
        self
    }

    /// Frees the worker but keeps the session's queue position.
    pub fn into_queue(mut self) -> Option<OwnedMutexGuard<()>> {
        self.queue.take()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
        self.slot.freed.notify_waiters();
        self.any_freed.notify_waiters();
    }
}

/// The outcome of routing one call.
pub struct Routed {
    pub worker: WorkerId,
    pub policy: AffinityPolicy,
    /// True when `Hint` moved the call off the session's last worker.
    pub rerouted: bool,
    pub lease: WorkerLease,
}

pub struct AffinityRouter {
    slots: DashMap<WorkerId, Arc<WorkerSlot>>,
    order: Vec<WorkerId>,
    any_freed: Arc<Notify>,
    default_policy: AffinityPolicy,
}

impl AffinityRouter {
    pub fn new(workers: impl IntoIterator<Item = WorkerId>, default_policy: AffinityPolicy) -> Result<Self> {
        let slots = DashMap::new();
        let mut order = Vec::new();
        for id in workers {
            if slots.insert(id, Arc::new(WorkerSlot::new(id))).is_none() {
                order.push(id);
            }
        }
        if order.is_empty() {
            return Err(RouteError::NoWorkers);
        }
        Ok(Self { slots, order, any_freed: Arc::new(Notify::new()), default_policy })
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.order
    }

    pub fn default_policy(&self) -> AffinityPolicy {
        self.default_policy
    }

    pub fn is_busy(&self, worker: WorkerId) -> bool {
        self.slots.get(&worker).is_some_and(|slot| slot.is_busy())
    }

    /// Call-site override, then session default, then global default.
    /// A tainted session always queues.
    pub fn effective_policy(&self, requested: Option<AffinityPolicy>, view: &RoutingView) -> AffinityPolicy {
        if view.taint.is_some() {
            return AffinityPolicy::StrictQueue;
        }
        requested.or(view.default_policy).unwrap_or(self.default_policy)
    }

    pub async fn route(
        &self,
        session: &SessionCell,
        requested: Option<AffinityPolicy>,
        deadline: Instant,
    ) -> Result<Routed> {
        let started = Instant::now();
        let view = session.routing_view();
        let policy = self.effective_policy(requested, &view);

        match policy {
            AffinityPolicy::StrictQueue => {
                let queue = tokio::time::timeout_at(deadline, session.queue().lock_owned())
                    .await
                    .map_err(|_| self.elapsed(session, started))?;

                // The call ahead in the queue may have moved affinity or left a taint.
                let view = session.routing_view();
                let target = view
                    .taint
                    .map(|taint| taint.worker)
                    .or(view.last_worker)
                    .filter(|w| self.slots.contains_key(w));

                let lease = match target {
                    Some(worker) => self.wait_for(worker, deadline).await,
                    None => self.wait_any(None, deadline).await,
                }
                .ok_or_else(|| self.elapsed(session, started))?;

                Ok(Routed { worker: lease.worker(), policy, rerouted: false, lease: lease.with_queue(Some(queue)) })
            }
            AffinityPolicy::Hint => {
                let preferred = self.known(view.last_worker);
                if let Some(lease) = preferred.and_then(|w| self.try_acquire(w)) {
                    return Ok(Routed { worker: lease.worker(), policy, rerouted: false, lease });
                }
                let lease = self.try_any(preferred).ok_or_else(|| RouteError::Busy {
                    session: session.id().clone(),
                    worker: preferred,
                })?;
                if let Some(from) = preferred {
                    tracing::debug!(session = %session.id(), %from, to = %lease.worker(), "hint reroute");
                }
                Ok(Routed { worker: lease.worker(), policy, rerouted: preferred.is_some(), lease })
            }
            AffinityPolicy::StrictFailFast => {
                let preferred = self.known(view.last_worker);
                let lease = match preferred {
                    Some(worker) => self.try_acquire(worker),
                    None => self.try_any(None),
                }
                .ok_or_else(|| RouteError::Busy { session: session.id().clone(), worker: preferred })?;
                Ok(Routed { worker: lease.worker(), policy, rerouted: false, lease })
            }
        }
    }

    /// Routes a retry to any worker other than `exclude`, waiting until the deadline.
    pub async fn route_excluding(
        &self,
        session: &SessionCell,
        exclude: WorkerId,
        policy: AffinityPolicy,
        queue: Option<OwnedMutexGuard<()>>,
        deadline: Instant,
    ) -> Result<Routed> {
        if self.order.iter().all(|w| *w == exclude) {
            return Err(RouteError::Busy { session: session.id().clone(), worker: None });
        }
        let started = Instant::now();
        let lease = self
            .wait_any(Some(exclude), deadline)
            .await
            .ok_or_else(|| self.elapsed(session, started))?;
        Ok(Routed { worker: lease.worker(), policy, rerouted: true, lease: lease.with_queue(queue) })
    }

    fn known(&self, worker: Option<WorkerId>) -> Option<WorkerId> {
        worker.filter(|w| self.slots.contains_key(w))
    }

    fn elapsed(&self, session: &SessionCell, started: Instant) -> RouteError {
        RouteError::DeadlineElapsed { session: session.id().clone(), waited: started.elapsed() }
    }

    fn lease(&self, slot: Arc<WorkerSlot>) -> WorkerLease {
        WorkerLease { slot, any_freed: self.any_freed.clone(), queue: None }
    }

    fn try_acquire(&self, worker: WorkerId) -> Option<WorkerLease> {
        let slot = self.slots.get(&worker)?.value().clone();
        slot.try_acquire().then(|| self.lease(slot))
    }

    /// Tries every worker except `exclude` in random order.
    fn try_any(&self, exclude: Option<WorkerId>) -> Option<WorkerLease> {
        let mut candidates: Vec<WorkerId> =
            self.order.iter().copied().filter(|w| Some(*w) != exclude).collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().find_map(|w| self.try_acquire(w))
    }

    async fn wait_for(&self, worker: WorkerId, deadline: Instant) -> Option<WorkerLease> {
        let slot = self.slots.get(&worker)?.value().clone();
        loop {
            let notified = slot.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if slot.try_acquire() {
                return Some(self.lease(slot.clone()));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    async fn wait_any(&self, exclude: Option<WorkerId>, deadline: Instant) -> Option<WorkerLease> {
        loop {
            let notified = self.any_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_any(exclude) {
                return Some(lease);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

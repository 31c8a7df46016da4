//! # Ownership Monitor
//!
//! Ties a session to the lifetime of the host computation that created it.
//! When the owner terminates (normally, by panic, or by being aborted) the
//! session is released and its remote objects are reclaimed.
//!
//! ## Invariants
//! - **One Watch Per Session**: registered at creation, aborted on explicit release.
//! - **Release Before Reclaim**: the session disappears from the registry
//!   synchronously; talking to workers happens afterwards and may fail
//!   without resurrecting it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::session::ReleasedSession;
use crate::session::SessionCell;
use crate::session::SessionRegistry;

/// Held by the owning task. Dropping it, by any means, terminates the owner.
#[derive(Debug)]
pub struct OwnerGuard {
    _alive: oneshot::Sender<()>,
}

/// A signal that resolves once a session's owner has terminated.
pub struct OwnerHandle {
    terminated: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
}

impl OwnerHandle {
    /// Creates a guard for the current task and the handle watching it.
    pub fn pair() -> (OwnerGuard, OwnerHandle) {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = Self::from_future(async move {
            let _ = rx.await;
        });
        (OwnerGuard { _alive: tx }, handle)
    }

    /// Watches a spawned task; the owner terminates when the task finishes,
    /// panics or is aborted.
    pub fn from_task<T: Send + 'static>(task: JoinHandle<T>) -> Self {
        Self::from_future(async move {
            let _ = task.await;
        })
    }

    /// Uses an arbitrary future as the termination signal.
    pub fn from_future(terminated: impl Future<Output = ()> + Send + 'static) -> Self {
        Self { terminated: Box::pin(terminated) }
    }

    async fn terminated(self) {
        self.terminated.await
    }
}

/// Receives sessions released by owner termination and frees their remote objects.
#[async_trait::async_trait]
pub trait Reclaim: Send + Sync + 'static {
    async fn reclaim(&self, released: ReleasedSession);
}

pub struct OwnershipMonitor {
    registry: Arc<SessionRegistry>,
    reclaimer: Arc<dyn Reclaim>,
}

impl OwnershipMonitor {
    pub fn new(registry: Arc<SessionRegistry>, reclaimer: Arc<dyn Reclaim>) -> Self {
        Self { registry, reclaimer }
    }

    /// Spawns the watch for `session`. Requires a tokio runtime.
    pub fn watch(&self, session: &Arc<SessionCell>, owner: OwnerHandle) {
        let registry = self.registry.clone();
        let reclaimer = self.reclaimer.clone();
        let cell = session.clone();

        let task = tokio::spawn(async move {
            owner.terminated().await;

            // Detach first: the release below must not abort this very task.
            cell.detach_monitor();
            let Some(released) = registry.release(cell.id()) else {
                return;
            };
            tracing::info!(
                session = %released.session_id,
                refs = released.ref_count(),
                "owner terminated, session released"
            );
            reclaimer.reclaim(released).await;
        });

        session.attach_monitor(task.abort_handle());
    }
}

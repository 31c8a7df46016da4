//! # Worker Pool Abstraction
//!
//! The seam between the bridge and whatever actually runs foreign code.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A pool moves encoded envelopes and responses. It never
//!   looks at sessions, refs or affinity; those live entirely in the bridge.
//! - **One Entry Point**: Every call shape goes through the same `invoke`.
//!   Spawning, sizing and health checks of workers are the pool's own business.

use std::fmt;

use tokio::time::Instant;

/// Strong type for worker identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Failures reported by a pool for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The worker did not answer before the deadline.
    #[error("{0} did not answer before the deadline")]
    Timeout(WorkerId),
    /// The worker process died while handling the call.
    #[error("{worker} crashed: {reason}")]
    Crashed { worker: WorkerId, reason: String },
    /// The call was interrupted by `cancel`.
    #[error("call {call_id} on {worker} was cancelled")]
    Cancelled { worker: WorkerId, call_id: u64 },
    /// The pool cannot interrupt in-flight calls.
    #[error("this pool does not support cancellation")]
    CancelUnsupported,
    #[error("{0} is not part of this pool")]
    UnknownWorker(WorkerId),
    /// Generic I/O failure between the bridge and the worker.
    #[error("I/O error on {worker}: {details}")]
    Io { worker: WorkerId, details: String },
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// A fixed set of workers that can each execute one envelope at a time.
///
/// This trait is designed to be object-safe (`Arc<dyn WorkerPool>`).
#[async_trait::async_trait]
pub trait WorkerPool: Send + Sync + 'static {
    /// The workers this pool can route to. Must be stable for the pool's lifetime.
    fn workers(&self) -> Vec<WorkerId>;

    /// Sends an encoded `CallEnvelope` to `worker` and waits for the encoded `Response`.
    ///
    /// # invariants
    /// - Must return `Ok(bytes)` whenever the worker produced a response,
    ///   including a response describing a remote exception.
    /// - Must return `Err(Crashed)` if the worker died mid-call.
    async fn invoke(&self, worker: WorkerId, payload: &[u8], deadline: Instant) -> Result<Vec<u8>>;

    /// Asks `worker` to abandon the call identified by `call_id`.
    async fn cancel(&self, worker: WorkerId, call_id: u64) -> Result<()> {
        let _ = (worker, call_id);
        Err(PoolError::CancelUnsupported)
    }
}

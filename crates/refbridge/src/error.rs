//! # Error Definitions
//!
//! The single error type surfaced to bridge callers. Component modules keep
//! their own narrower enums and convert into this one at the facade.

use std::time::Duration;

use refwire::RefId;
use refwire::SessionId;
use refwire::WireError;

use crate::dispatch::ArityError;
use crate::dispatch::MaxArity;
use crate::pool::WorkerId;
use crate::refs::StaleReason;
use crate::router::RouteError;
use crate::translate::RemoteFailure;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The session was never created or has already been released.
    #[error("session {0} does not exist")]
    SessionNotFound(SessionId),
    /// A ref was used from a session that does not own it.
    #[error("ref {ref_id} belongs to session {owner} and cannot be used from session {session}")]
    RefSessionMismatch { ref_id: RefId, owner: SessionId, session: SessionId },
    /// Positional argument count outside the declared range.
    #[error("{target} accepts {min}..{max} positional arguments, got {given}")]
    ArityNotSupported { target: String, given: usize, min: usize, max: MaxArity },
    #[error("{target} requires keyword argument `{keyword}`")]
    MissingRequiredKeyword { target: String, keyword: String },
    #[error("protocol version {found} is outside the supported range {min}..={max}")]
    ProtocolVersionUnsupported { found: u64, min: u32, max: u32 },
    /// The session's affinity policy does not allow waiting for a worker.
    #[error("no worker available for session {session} (preferred: {})", display_worker(.worker))]
    WorkerBusy { session: SessionId, worker: Option<WorkerId> },
    #[error("{worker} crashed during the call{}: {reason}", retry_note(.retried))]
    WorkerCrashed { worker: WorkerId, reason: String, retried: bool },
    /// The call deadline passed. Never retried.
    #[error("{target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },
    /// The remote code raised an exception.
    #[error("remote error: {0}")]
    Remote(RemoteFailure),
    #[error("ref {ref_id} is stale: {reason}")]
    StaleRef { ref_id: RefId, reason: StaleReason },
    /// The target has no declared signature; use `call_dynamic` instead.
    #[error("{0} is not declared")]
    NotDeclared(String),
    #[error("attribute {module}.{attr} is read-only")]
    ReadOnlyAttribute { module: String, attr: String },
    #[error("the worker pool has no workers")]
    NoWorkers,
    #[error("wire error: {0}")]
    Wire(WireError),
    /// The worker answered with something that is not a valid reply to the call.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

fn display_worker(worker: &Option<WorkerId>) -> String {
    match worker {
        Some(w) => w.to_string(),
        None => "any".into(),
    }
}

fn retry_note(retried: &bool) -> &'static str {
    if *retried { " (after retry)" } else { "" }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ProtocolVersionUnsupported { found, min, max } => {
                Self::ProtocolVersionUnsupported { found, min, max }
            }
            WireError::ForeignRef { ref_id, owner, session } => Self::RefSessionMismatch {
                ref_id: RefId::new(ref_id),
                owner: SessionId::new(owner),
                session: SessionId::new(session),
            },
            other => Self::Wire(other),
        }
    }
}

impl From<ArityError> for Error {
    fn from(e: ArityError) -> Self {
        match e {
            ArityError::NotSupported { target, given, min, max } => {
                Self::ArityNotSupported { target, given, min, max }
            }
            ArityError::MissingKeyword { target, keyword } => {
                Self::MissingRequiredKeyword { target, keyword }
            }
        }
    }
}

impl From<RouteError> for Error {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::Busy { session, worker } => Self::WorkerBusy { session, worker },
            RouteError::DeadlineElapsed { session, waited } => Self::Timeout {
                target: format!("routing for session {}", session),
                after: waited,
            },
            RouteError::NoWorkers => Self::NoWorkers,
        }
    }
}

/// A specialized Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

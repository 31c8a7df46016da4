//! Mock worker pool for testing.
//!
//! `MockPool` decodes each envelope and answers like a small worker would:
//! constructors can create objects that live on the answering worker, method
//! calls on objects the worker does not hold fail remotely, and `Release`
//! envelopes drop objects. Everything else is decided by a handler closure.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use dashmap::DashMap;
use refwire::CallEnvelope;
use refwire::CallType;
use refwire::RefId;
use refwire::RemoteErrorPayload;
use refwire::Response;
use refwire::WireRef;
use refwire::WireValue;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::pool;
use crate::pool::PoolError;
use crate::pool::WorkerId;
use crate::pool::WorkerPool;

/// One envelope as received by a mock worker.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub worker: WorkerId,
    pub envelope: CallEnvelope,
}

impl MockCall {
    pub fn arg(&self, index: usize) -> Option<&WireValue> {
        self.envelope.args.get(index)
    }

    /// `module.name` for functions, `<ref>.name` for methods, and so on.
    pub fn target(&self) -> String {
        self.envelope.target.to_string()
    }
}

enum MockOutcome {
    Value(WireValue),
    Object { module: String, type_name: String },
    Error(RemoteErrorPayload),
    Crash(String),
}

/// What a mock worker does with a call.
pub struct MockReply {
    delay: Duration,
    outcome: MockOutcome,
}

impl MockReply {
    pub fn value(value: WireValue) -> Self {
        Self { delay: Duration::ZERO, outcome: MockOutcome::Value(value) }
    }

    /// Creates a new object on the answering worker and returns a ref to it.
    pub fn object(module: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: MockOutcome::Object { module: module.into(), type_name: type_name.into() },
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failure(RemoteErrorPayload::new(kind, message))
    }

    pub fn failure(payload: RemoteErrorPayload) -> Self {
        Self { delay: Duration::ZERO, outcome: MockOutcome::Error(payload) }
    }

    /// Kills the worker mid-call. Objects it held are lost.
    pub fn crash(reason: impl Into<String>) -> Self {
        Self { delay: Duration::ZERO, outcome: MockOutcome::Crash(reason.into()) }
    }

    /// Delays the answer. The mock ignores deadlines; only `cancel` cuts it short.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = dyn Fn(&MockCall) -> MockReply + Send + Sync;

pub struct MockPool {
    workers: Vec<WorkerId>,
    handler: Box<Handler>,
    calls: Mutex<Vec<MockCall>>,
    objects: DashMap<RefId, WorkerId>,
    released: Mutex<Vec<RefId>>,
    next_object: AtomicU64,
    pending_crashes: AtomicUsize,
    cancellable: bool,
    in_flight: DashMap<u64, Arc<Notify>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockPool {
    /// A pool of `workers` workers answering with `handler`.
    pub fn new(workers: usize, handler: impl Fn(&MockCall) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            workers: (1..=workers as u64).map(WorkerId).collect(),
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            objects: DashMap::new(),
            released: Mutex::new(Vec::new()),
            next_object: AtomicU64::new(1),
            pending_crashes: AtomicUsize::new(0),
            cancellable: false,
            in_flight: DashMap::new(),
        }
    }

    /// A pool whose workers return their first positional argument, or null.
    pub fn echo(workers: usize) -> Self {
        Self::new(workers, |call| MockReply::value(call.arg(0).cloned().unwrap_or(WireValue::Null)))
    }

    /// Lets `cancel` interrupt delayed answers.
    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    /// Makes the next `n` non-release invocations crash their worker.
    pub fn crash_next(&self, n: usize) {
        self.pending_crashes.fetch_add(n, Ordering::SeqCst);
    }

    /// Every envelope received so far, in arrival order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Ids dropped through `Release` envelopes.
    pub fn released(&self) -> Vec<RefId> {
        lock(&self.released).clone()
    }

    /// The worker holding object `id`, if it is alive.
    pub fn holder(&self, id: &RefId) -> Option<WorkerId> {
        self.objects.get(id).map(|worker| *worker.value())
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    fn take_crash(&self) -> bool {
        self.pending_crashes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn crash(&self, worker: WorkerId, reason: String) -> PoolError {
        self.objects.retain(|_, holder| *holder != worker);
        PoolError::Crashed { worker, reason }
    }

    fn release(&self, call: &MockCall) -> Response {
        let mut released = lock(&self.released);
        for arg in &call.envelope.args {
            if let WireValue::Ref(r) = arg {
                self.objects.remove(&r.id);
                released.push(r.id.clone());
            }
        }
        Response::success(call.envelope.call_id, WireValue::Null)
    }

    fn respond(&self, call: &MockCall, outcome: MockOutcome) -> pool::Result<Response> {
        let call_id = call.envelope.call_id;
        let response = match outcome {
            MockOutcome::Value(value) => Response::success(call_id, value),
            MockOutcome::Object { module, type_name } => {
                let id = RefId::new(format!("obj-{}", self.next_object.fetch_add(1, Ordering::Relaxed)));
                self.objects.insert(id.clone(), call.worker);
                Response::success(
                    call_id,
                    WireValue::Ref(WireRef {
                        id,
                        session_id: Some(call.envelope.session_id.clone()),
                        module,
                        type_name: Some(type_name),
                    }),
                )
            }
            MockOutcome::Error(payload) => Response::failure(call_id, payload),
            MockOutcome::Crash(reason) => return Err(self.crash(call.worker, reason)),
        };
        Ok(response)
    }
}

#[async_trait::async_trait]
impl WorkerPool for MockPool {
    fn workers(&self) -> Vec<WorkerId> {
        self.workers.clone()
    }

    async fn invoke(&self, worker: WorkerId, payload: &[u8], _deadline: Instant) -> pool::Result<Vec<u8>> {
        if !self.workers.contains(&worker) {
            return Err(PoolError::UnknownWorker(worker));
        }
        let envelope = CallEnvelope::from_bytes(payload)
            .map_err(|e| PoolError::Io { worker, details: e.to_string() })?;
        let call = MockCall { worker, envelope };
        lock(&self.calls).push(call.clone());
        let call_id = call.envelope.call_id;

        let response = if call.envelope.call_type() == CallType::Release {
            self.release(&call)
        } else if self.take_crash() {
            return Err(self.crash(worker, "injected crash".into()));
        } else if let Some(receiver) = call
            .envelope
            .target
            .receiver()
            .filter(|r| self.holder(&r.id) != Some(worker))
        {
            let message = format!("{} holds no object {}", worker, receiver.id);
            Response::failure(call_id, RemoteErrorPayload::new("ReferenceError", message))
        } else {
            let reply = (self.handler)(&call);
            if !reply.delay.is_zero() {
                let cancel = Arc::new(Notify::new());
                self.in_flight.insert(call_id, cancel.clone());
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(reply.delay) => false,
                    _ = cancel.notified() => true,
                };
                self.in_flight.remove(&call_id);
                if cancelled {
                    return Err(PoolError::Cancelled { worker, call_id });
                }
            }
            self.respond(&call, reply.outcome)?
        };

        response.to_bytes().map_err(|e| PoolError::Io { worker, details: e.to_string() })
    }

    async fn cancel(&self, _worker: WorkerId, call_id: u64) -> pool::Result<()> {
        if !self.cancellable {
            return Err(PoolError::CancelUnsupported);
        }
        if let Some(cancel) = self.in_flight.get(&call_id) {
            cancel.notify_one();
        }
        Ok(())
    }
}

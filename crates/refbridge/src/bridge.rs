//! # Bridge
//!
//! The facade generated bindings call into. A call flows through:
//!
//! 1. session resolution (explicit, ambient `with_session` scope, or default),
//! 2. local validation (ref ownership, arity, keywords, encodability),
//! 3. affinity routing,
//! 4. stale-ref detection against the routed worker,
//! 5. the pool invocation under the call deadline,
//! 6. response decoding, ref binding and error translation.
//!
//! ## Invariants
//! - **Local First**: validation failures never produce wire traffic and are never retried.
//! - **Cancel Or Taint**: a timed-out call is either cancelled on the worker or
//!   its session is tainted until the worker confirms completion.
//! - **Single Retry**: only idempotent calls are retried after a crash, on a different worker.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use refwire::ref_to_wire;
use refwire::AttrOp;
use refwire::CallEnvelope;
use refwire::Codec;
use refwire::Outcome;
use refwire::Ref;
use refwire::Response;
use refwire::SessionId;
use refwire::Target;
use refwire::Value;
use refwire::WireValue;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::builder::BridgeBuilder;
use crate::config::BridgeConfig;
use crate::dispatch::build_call;
use crate::dispatch::ArityInfo;
use crate::dispatch::CallSite;
use crate::dispatch::Catalog;
use crate::dispatch::Signature;
use crate::error::Error;
use crate::error::Result;
use crate::monitor::OwnerHandle;
use crate::monitor::OwnershipMonitor;
use crate::monitor::Reclaim;
use crate::pool::PoolError;
use crate::pool::WorkerId;
use crate::pool::WorkerPool;
use crate::router::AffinityPolicy;
use crate::router::AffinityRouter;
use crate::router::RouteError;
use crate::router::Routed;
use crate::session::ReleasedSession;
use crate::session::SessionCell;
use crate::session::SessionInfo;
use crate::session::SessionRegistry;
use crate::session::Taint;
use crate::translate::ErrorTranslator;

/// Keyword arguments of a call.
pub type Kwargs = BTreeMap<String, Value>;

tokio::task_local! {
    static CURRENT_SESSION: SessionId;
}

/// Per-call settings. Unset fields fall back to session and bridge defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub policy: Option<AffinityPolicy>,
    pub timeout: Option<Duration>,
    pub idempotent: bool,
    pub session: Option<SessionId>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: AffinityPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the call safe to run twice, which enables the crash retry.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn session(mut self, id: SessionId) -> Self {
        self.session = Some(id);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub default_policy: Option<AffinityPolicy>,
}

impl SessionOptions {
    pub fn policy(mut self, policy: AffinityPolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }
}

/// What an attribute access is aimed at.
#[derive(Debug, Clone, Copy)]
pub enum AttrTarget<'a> {
    Module(&'a str),
    Ref(&'a Ref),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Running,
    Finished,
    /// Timed out locally and could not be cancelled.
    Abandoned,
}

enum SendError {
    Crashed { reason: String, queue: Option<OwnedMutexGuard<()>> },
    Fatal(Error),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A cheaply cloneable handle to the bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

struct Inner {
    config: BridgeConfig,
    pool: Arc<dyn WorkerPool>,
    codec: Codec,
    catalog: Catalog,
    registry: Arc<SessionRegistry>,
    router: AffinityRouter,
    monitor: OwnershipMonitor,
    translator: ErrorTranslator,
    reclaimer: Arc<PoolReclaimer>,
    call_ids: Arc<AtomicU64>,
    default_session: Mutex<Option<SessionId>>,
}

impl Bridge {
    pub fn builder(pool: Arc<dyn WorkerPool>) -> BridgeBuilder {
        BridgeBuilder::new(pool)
    }

    pub(crate) fn from_parts(pool: Arc<dyn WorkerPool>, catalog: Catalog, config: BridgeConfig) -> Result<Self> {
        let router = AffinityRouter::new(pool.workers(), config.default_policy)?;
        let registry = Arc::new(SessionRegistry::new());
        let call_ids = Arc::new(AtomicU64::new(1));
        let reclaimer = Arc::new(PoolReclaimer {
            pool: pool.clone(),
            call_ids: call_ids.clone(),
            protocol_version: config.protocol_version,
            timeout: config.call_timeout,
        });
        let monitor = OwnershipMonitor::new(registry.clone(), reclaimer.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                codec: Codec::new(catalog.atom_table()),
                translator: ErrorTranslator::new(config.max_derived_kinds),
                config,
                pool,
                catalog,
                registry,
                router,
                monitor,
                reclaimer,
                call_ids,
                default_session: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn workers(&self) -> &[WorkerId] {
        self.inner.router.workers()
    }

    // ========================================================================
    //  SESSIONS
    // ========================================================================

    /// Opens a session released automatically when `owner` terminates.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_session(&self, opts: SessionOptions, owner: OwnerHandle) -> SessionScope {
        let cell = self.inner.registry.create(opts.default_policy);
        self.inner.monitor.watch(&cell, owner);
        SessionScope { bridge: self.clone(), id: cell.id().clone() }
    }

    /// Opens a session that lives until `release_session` is called.
    pub fn open_detached_session(&self, opts: SessionOptions) -> SessionScope {
        let cell = self.inner.registry.create(opts.default_policy);
        SessionScope { bridge: self.clone(), id: cell.id().clone() }
    }

    /// Runs `f` inside a fresh session that is ambient for every bridge call
    /// made by the future. The session is released when `f` completes or is dropped.
    pub async fn with_session<F, Fut, T>(&self, opts: SessionOptions, f: F) -> T
    where
        F: FnOnce(SessionScope) -> Fut,
        Fut: Future<Output = T>,
    {
        let (guard, owner) = OwnerHandle::pair();
        let scope = self.open_session(opts, owner);
        let id = scope.id().clone();

        let output = CURRENT_SESSION.scope(id.clone(), f(scope)).await;

        self.release_session(&id).await;
        drop(guard);
        output
    }

    /// The session of the enclosing `with_session` scope, if any.
    pub fn current_session() -> Option<SessionId> {
        CURRENT_SESSION.try_with(SessionId::clone).ok()
    }

    /// Handle to an existing session.
    pub fn session(&self, id: &SessionId) -> Result<SessionScope> {
        let cell = self.inner.registry.get(id)?;
        Ok(SessionScope { bridge: self.clone(), id: cell.id().clone() })
    }

    pub fn session_exists(&self, id: &SessionId) -> bool {
        self.inner.registry.exists(id)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.sessions()
    }

    /// The bridge-wide session used by calls made outside any scope.
    /// Recreated on demand if it was released.
    pub fn default_session(&self) -> SessionId {
        self.default_cell().id().clone()
    }

    /// Releases a session and tells its workers to drop its objects.
    ///
    /// Returns false if the session was already gone.
    pub async fn release_session(&self, id: &SessionId) -> bool {
        match self.inner.registry.release(id) {
            Some(released) => {
                self.inner.reclaimer.reclaim(released).await;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    //  CALLS
    // ========================================================================

    /// Calls a declared module-level function.
    pub async fn call(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: CallOptions,
    ) -> Result<Value> {
        let signature = self
            .inner
            .catalog
            .function_signature(module, function)
            .cloned()
            .ok_or_else(|| Error::NotDeclared(format!("{}.{}", module, function)))?;
        let session = self.resolve(&opts)?;
        let target = Target::Function { module: module.into(), name: function.into() };
        self.invoke(session, target, &signature, None, args, kwargs, &opts).await
    }

    /// Instantiates a declared class. The result is normally a `Value::Ref`.
    pub async fn construct(
        &self,
        module: &str,
        class: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: CallOptions,
    ) -> Result<Value> {
        let signature = self
            .inner
            .catalog
            .class_decl(module, class)
            .map(|decl| decl.constructor.clone())
            .ok_or_else(|| Error::NotDeclared(format!("{}.{}", module, class)))?;
        let session = self.resolve(&opts)?;
        let target = Target::ClassInit { module: module.into(), class: class.into() };
        self.invoke(session, target, &signature, None, args, kwargs, &opts).await
    }

    /// Calls a method on a remote object.
    ///
    /// Methods of undeclared types accept up to `variadic_ceiling` positional arguments.
    pub async fn call_method(
        &self,
        receiver: &Ref,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: CallOptions,
    ) -> Result<Value> {
        let signature = self.inner.catalog.method_signature(
            &receiver.remote_module,
            receiver.remote_type.as_deref(),
            method,
        );
        let session = self.resolve(&opts)?;
        let target = Target::Method { receiver: ref_to_wire(receiver), name: method.into() };
        self.invoke(session, target, &signature, Some(receiver), args, kwargs, &opts).await
    }

    /// Calls anything by dotted path, bypassing the catalog.
    pub async fn call_dynamic(
        &self,
        path: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: CallOptions,
    ) -> Result<Value> {
        let session = self.resolve(&opts)?;
        let target = Target::Dynamic { path: path.into() };
        self.invoke(session, target, &Signature::Opaque, None, args, kwargs, &opts).await
    }

    pub async fn get_attr(&self, target: AttrTarget<'_>, name: &str, opts: CallOptions) -> Result<Value> {
        let session = self.resolve(&opts)?;
        let getter = Signature::Declared(ArityInfo::fixed(0));
        match target {
            AttrTarget::Module(module) => {
                if !self.inner.catalog.has_module_attr(module, name) {
                    return Err(Error::NotDeclared(format!("{}.{}", module, name)));
                }
                let target = Target::ModuleAttr { module: module.into(), attr: name.into() };
                self.invoke(session, target, &getter, None, Vec::new(), Kwargs::new(), &opts).await
            }
            AttrTarget::Ref(receiver) => {
                let target = Target::RefAttr { receiver: ref_to_wire(receiver), attr: name.into(), op: AttrOp::Get };
                self.invoke(session, target, &getter, Some(receiver), Vec::new(), Kwargs::new(), &opts).await
            }
        }
    }

    /// Sets an attribute on a remote object. Module attributes are read-only.
    pub async fn set_attr(&self, target: AttrTarget<'_>, name: &str, value: Value, opts: CallOptions) -> Result<()> {
        let receiver = match target {
            AttrTarget::Module(module) => {
                return Err(Error::ReadOnlyAttribute { module: module.into(), attr: name.into() });
            }
            AttrTarget::Ref(receiver) => receiver,
        };
        let session = self.resolve(&opts)?;
        let setter = Signature::Declared(ArityInfo::fixed(1));
        let target = Target::RefAttr { receiver: ref_to_wire(receiver), attr: name.into(), op: AttrOp::Set };
        self.invoke(session, target, &setter, Some(receiver), vec![value], Kwargs::new(), &opts)
            .await
            .map(|_| ())
    }

    /// Releases one ref ahead of its session. Releasing twice is a no-op.
    pub async fn release_ref(&self, handle: &Ref) -> Result<()> {
        if let Some(current) = Self::current_session() {
            if current != handle.session_id {
                return Err(Error::RefSessionMismatch {
                    ref_id: handle.id.clone(),
                    owner: handle.session_id.clone(),
                    session: current,
                });
            }
        }
        let Ok(session) = self.inner.registry.get(&handle.session_id) else {
            return Ok(());
        };
        if let Some((handle, worker)) = session.forget_ref(&handle.id) {
            self.inner.reclaimer.release_on(session.id(), worker, vec![handle]).await;
        }
        Ok(())
    }

    // ========================================================================
    //  CALL PIPELINE
    // ========================================================================

    fn resolve(&self, opts: &CallOptions) -> Result<Arc<SessionCell>> {
        if let Some(id) = &opts.session {
            return self.inner.registry.get(id);
        }
        if let Some(id) = Self::current_session() {
            return self.inner.registry.get(&id);
        }
        Ok(self.default_cell())
    }

    fn default_cell(&self) -> Arc<SessionCell> {
        let mut slot = lock(&self.inner.default_session);
        if let Some(cell) = slot.as_ref().and_then(|id| self.inner.registry.get(id).ok()) {
            return cell;
        }
        let cell = self.inner.registry.create(None);
        *slot = Some(cell.id().clone());
        cell
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        session: Arc<SessionCell>,
        target: Target,
        signature: &Signature,
        receiver: Option<&Ref>,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
    ) -> Result<Value> {
        let inner = &self.inner;
        let session_id = session.id().clone();

        let mut carried: Vec<Ref> = receiver.into_iter().cloned().collect();
        for value in args.iter().chain(kwargs.values()) {
            value.for_each_ref(&mut |r| carried.push(r.clone()));
        }
        if let Some(foreign) = carried.iter().find(|r| r.session_id != session_id) {
            return Err(Error::RefSessionMismatch {
                ref_id: foreign.id.clone(),
                owner: foreign.session_id.clone(),
                session: session_id,
            });
        }

        let wire_args = args
            .iter()
            .map(|value| inner.codec.encode(value))
            .collect::<refwire::Result<Vec<WireValue>>>()?;
        let mut wire_kwargs = BTreeMap::new();
        for (key, value) in &kwargs {
            wire_kwargs.insert(key.clone(), inner.codec.encode(value)?);
        }

        let site = CallSite {
            call_id: inner.call_ids.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.clone(),
            target,
            idempotent: opts.idempotent,
            protocol_version: inner.config.protocol_version,
        };
        let envelope = build_call(signature, site, wire_args, wire_kwargs, inner.config.variadic_ceiling)?;
        // Unwrapped host objects are rejected here, before a worker is claimed.
        let payload = envelope.to_bytes()?;

        let timeout = opts.timeout.unwrap_or(inner.config.call_timeout);
        let deadline = Instant::now() + timeout;

        let mut routed = inner
            .router
            .route(&session, opts.policy, deadline)
            .await
            .map_err(|e| self.route_error(e, &envelope, timeout))?;
        self.check_refs(&session, &carried, routed.worker)?;

        let mut attempt: u32 = 0;
        loop {
            let worker = routed.worker;
            let policy = routed.policy;
            tracing::debug!(
                call_id = envelope.call_id,
                session = %session_id,
                target = %envelope.target,
                %worker,
                ?policy,
                rerouted = routed.rerouted,
                "dispatching call"
            );

            match self.send(&session, &envelope, &payload, routed, deadline, timeout).await {
                Ok(response) => return self.finish(&session, &envelope, response, worker),
                Err(SendError::Fatal(e)) => return Err(e),
                Err(SendError::Crashed { reason, queue }) => {
                    let lost = inner.registry.mark_worker_lost(worker);
                    tracing::warn!(
                        call_id = envelope.call_id,
                        %worker,
                        lost_refs = lost,
                        %reason,
                        "worker crashed during call"
                    );
                    let crashed = Error::WorkerCrashed { worker, reason, retried: attempt > 0 };
                    if !envelope.idempotent || attempt >= inner.config.crash_retries {
                        return Err(crashed);
                    }
                    attempt += 1;

                    routed = match inner.router.route_excluding(&session, worker, policy, queue, deadline).await {
                        Ok(routed) => routed,
                        Err(_) => return Err(crashed),
                    };
                    if self.check_refs(&session, &carried, routed.worker).is_err() {
                        return Err(crashed);
                    }
                    tracing::info!(call_id = envelope.call_id, from = %worker, to = %routed.worker, "retrying idempotent call");
                }
            }
        }
    }

    fn route_error(&self, error: RouteError, envelope: &CallEnvelope, timeout: Duration) -> Error {
        match error {
            RouteError::DeadlineElapsed { .. } => Error::Timeout { target: envelope.target.to_string(), after: timeout },
            other => other.into(),
        }
    }

    fn check_refs(&self, session: &SessionCell, refs: &[Ref], worker: WorkerId) -> Result<()> {
        let independent = self.inner.config.worker_independent_refs;
        for handle in refs {
            session
                .check_ref(&handle.id, worker, independent)
                .map_err(|reason| Error::StaleRef { ref_id: handle.id.clone(), reason })?;
        }
        Ok(())
    }

    /// Runs the invocation in its own task so that a local timeout does not
    /// drop the worker lease while the worker is still busy.
    async fn send(
        &self,
        session: &Arc<SessionCell>,
        envelope: &CallEnvelope,
        payload: &[u8],
        routed: Routed,
        deadline: Instant,
        timeout: Duration,
    ) -> std::result::Result<Response, SendError> {
        let worker = routed.worker;
        let call_id = envelope.call_id;
        let state = Arc::new(Mutex::new(CallState::Running));

        let task = tokio::spawn({
            let pool = self.inner.pool.clone();
            let payload = payload.to_vec();
            let session = session.clone();
            let state = state.clone();
            let lease = routed.lease;
            async move {
                let result = pool.invoke(worker, &payload, deadline).await;
                let mut current = lock(&state);
                if *current == CallState::Abandoned && session.clear_taint(call_id) {
                    tracing::info!(session = %session.id(), %worker, call_id, "abandoned call finished, taint cleared");
                }
                *current = CallState::Finished;
                drop(current);
                (result, lease.into_queue())
            }
        });

        let timed_out = || Error::Timeout { target: envelope.target.to_string(), after: timeout };
        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok((Ok(bytes), _queue))) => Response::from_bytes(&bytes).map_err(|e| SendError::Fatal(e.into())),
            Ok(Ok((Err(PoolError::Crashed { reason, .. }), queue))) => Err(SendError::Crashed { reason, queue }),
            Ok(Ok((Err(PoolError::Timeout(_) | PoolError::Cancelled { .. }), _))) => Err(SendError::Fatal(timed_out())),
            Ok(Ok((Err(other), _))) => Err(SendError::Fatal(Error::Protocol(other.to_string()))),
            Ok(Err(join)) => Err(SendError::Fatal(Error::Protocol(format!("invocation task failed: {}", join)))),
            Err(_) => {
                self.abandon(session, worker, call_id, &state).await;
                Err(SendError::Fatal(timed_out()))
            }
        }
    }

    async fn abandon(&self, session: &SessionCell, worker: WorkerId, call_id: u64, state: &Mutex<CallState>) {
        let error = match self.inner.pool.cancel(worker, call_id).await {
            Ok(()) => {
                tracing::debug!(session = %session.id(), %worker, call_id, "timed-out call cancelled");
                return;
            }
            Err(e) => e,
        };

        let mut current = lock(state);
        if *current == CallState::Running {
            *current = CallState::Abandoned;
            session.set_taint(Taint { worker, call_id });
            tracing::warn!(
                session = %session.id(),
                %worker,
                call_id,
                %error,
                "timed-out call could not be cancelled; session tainted until it completes"
            );
        }
    }

    fn finish(&self, session: &SessionCell, envelope: &CallEnvelope, response: Response, worker: WorkerId) -> Result<Value> {
        if let Some(reply_to) = response.call_id {
            if reply_to != envelope.call_id {
                return Err(Error::Protocol(format!(
                    "reply for call {} received for call {}",
                    reply_to, envelope.call_id
                )));
            }
        }

        match response.outcome {
            Outcome::Success(wire) => {
                let value = self.inner.codec.decode(&wire, session.id())?;
                let mut fresh = Vec::new();
                value.for_each_ref(&mut |r| fresh.push(r.clone()));
                for handle in fresh {
                    session.bind_ref(handle, worker)?;
                }
                session.record_success(worker);
                Ok(value)
            }
            Outcome::Failure(payload) => Err(Error::Remote(self.inner.translator.translate(&payload))),
        }
    }
}

// ============================================================================
//  SESSION SCOPE
// ============================================================================

/// A bridge handle pinned to one session.
#[derive(Clone)]
pub struct SessionScope {
    bridge: Bridge,
    id: SessionId,
}

impl SessionScope {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    fn pinned(&self, opts: CallOptions) -> CallOptions {
        opts.session(self.id.clone())
    }

    pub async fn call(&self, module: &str, function: &str, args: Vec<Value>, kwargs: Kwargs, opts: CallOptions) -> Result<Value> {
        self.bridge.call(module, function, args, kwargs, self.pinned(opts)).await
    }

    pub async fn construct(&self, module: &str, class: &str, args: Vec<Value>, kwargs: Kwargs, opts: CallOptions) -> Result<Value> {
        self.bridge.construct(module, class, args, kwargs, self.pinned(opts)).await
    }

    pub async fn call_method(&self, receiver: &Ref, method: &str, args: Vec<Value>, kwargs: Kwargs, opts: CallOptions) -> Result<Value> {
        self.bridge.call_method(receiver, method, args, kwargs, self.pinned(opts)).await
    }

    pub async fn call_dynamic(&self, path: &str, args: Vec<Value>, kwargs: Kwargs, opts: CallOptions) -> Result<Value> {
        self.bridge.call_dynamic(path, args, kwargs, self.pinned(opts)).await
    }

    pub async fn get_attr(&self, target: AttrTarget<'_>, name: &str, opts: CallOptions) -> Result<Value> {
        self.bridge.get_attr(target, name, self.pinned(opts)).await
    }

    pub async fn set_attr(&self, target: AttrTarget<'_>, name: &str, value: Value, opts: CallOptions) -> Result<()> {
        self.bridge.set_attr(target, name, value, self.pinned(opts)).await
    }

    /// Changes the policy used when a call does not pick one.
    pub fn set_default_policy(&self, policy: Option<AffinityPolicy>) -> Result<()> {
        self.bridge.inner.registry.get(&self.id)?.set_default_policy(policy);
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.bridge.session_exists(&self.id)
    }

    pub fn info(&self) -> Result<SessionInfo> {
        Ok(self.bridge.inner.registry.get(&self.id)?.info())
    }

    pub async fn release(&self) -> bool {
        self.bridge.release_session(&self.id).await
    }
}

// ============================================================================
//  RECLAMATION
// ============================================================================

/// Sends best-effort `Release` envelopes for refs whose session is gone.
struct PoolReclaimer {
    pool: Arc<dyn WorkerPool>,
    call_ids: Arc<AtomicU64>,
    protocol_version: u32,
    timeout: Duration,
}

impl PoolReclaimer {
    async fn release_on(&self, session: &SessionId, worker: WorkerId, refs: Vec<Ref>) {
        let count = refs.len();
        let mut envelope = CallEnvelope::new(
            self.call_ids.fetch_add(1, Ordering::Relaxed),
            session.clone(),
            Target::Release,
        );
        envelope.protocol_version = self.protocol_version;
        envelope.idempotent = true;
        envelope.args = refs.iter().map(|r| WireValue::Ref(ref_to_wire(r))).collect();

        let result = match envelope.to_bytes() {
            Ok(payload) => self.send(worker, &payload).await,
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => tracing::debug!(session = %session, %worker, refs = count, "refs released"),
            Err(error) => tracing::warn!(
                session = %session,
                %worker,
                refs = count,
                %error,
                "failed to release refs; the worker keeps them as orphans"
            ),
        }
    }

    async fn send(&self, worker: WorkerId, payload: &[u8]) -> std::result::Result<(), String> {
        let deadline = Instant::now() + self.timeout;
        let bytes = self.pool.invoke(worker, payload, deadline).await.map_err(|e| e.to_string())?;
        let response = Response::from_bytes(&bytes).map_err(|e| e.to_string())?;
        match response.outcome {
            Outcome::Success(_) => Ok(()),
            Outcome::Failure(error) => Err(format!("{}: {}", error.kind, error.message)),
        }
    }
}

#[async_trait::async_trait]
impl Reclaim for PoolReclaimer {
    async fn reclaim(&self, released: ReleasedSession) {
        for (worker, refs) in released.refs_by_worker {
            self.release_on(&released.session_id, worker, refs).await;
        }
    }
}

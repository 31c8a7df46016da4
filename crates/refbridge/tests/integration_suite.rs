//! Integration tests for the bridge against the mock worker pool.

use std::sync::Arc;
use std::time::Duration;

use refbridge::mock_pool::MockPool;
use refbridge::mock_pool::MockReply;
use refbridge::refs::StaleReason;
use refbridge::AffinityPolicy;
use refbridge::ArityInfo;
use refbridge::AttrTarget;
use refbridge::Bridge;
use refbridge::CallOptions;
use refbridge::Catalog;
use refbridge::ClassDecl;
use refbridge::Error;
use refbridge::Kwargs;
use refbridge::OwnerHandle;
use refbridge::RemoteFailure;
use refbridge::SessionOptions;
use refbridge::Signature;
use refwire::AtomTable;
use refwire::Ref;
use refwire::RemoteErrorPayload;
use refwire::TypeHint;
use refwire::Value;
use refwire::WireError;
use refwire::WireValue;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn catalog() -> Catalog {
    Catalog::new()
        .function("geo", "span", Signature::Declared(ArityInfo::range(2, 4)))
        .function("stats", "mean", Signature::Declared(ArityInfo::fixed(1).required_keyword("axis")))
        .class(
            "shapes",
            "Box",
            ClassDecl::new(Signature::Declared(ArityInfo::range(0, 2)))
                .method("size", Signature::Declared(ArityInfo::fixed(0)))
                .method("slow", Signature::Declared(ArityInfo::fixed(0))),
        )
        .module_attr("math", "pi")
}

/// Objects for constructors, a slow method, echo for everything else.
fn worker(call: &refbridge::mock_pool::MockCall) -> MockReply {
    let target = call.target();
    if target.ends_with("()") || target == "numpy.array" {
        MockReply::object("shapes", "Box")
    } else if target.ends_with(".slow") {
        MockReply::value(WireValue::Str("done".into())).after(Duration::from_millis(400))
    } else if target == "math.pi" {
        MockReply::value(WireValue::Float(3.25))
    } else {
        MockReply::value(call.arg(0).cloned().unwrap_or(WireValue::Null))
    }
}

fn bridge(pool: &Arc<MockPool>) -> anyhow::Result<Bridge> {
    init_tracing();
    Ok(Bridge::builder(pool.clone()).catalog(catalog()).build()?)
}

fn as_ref(value: Value) -> anyhow::Result<Ref> {
    match value {
        Value::Ref(r) => Ok(r),
        other => anyhow::bail!("expected a ref, got {:?}", other),
    }
}

fn no_args() -> (Vec<Value>, Kwargs) {
    (Vec::new(), Kwargs::new())
}

// --- Test 1: Round Trip Through A Worker ---

#[tokio::test]
async fn test_round_trip_nested_value() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::echo(2));
    let bridge = bridge(&pool)?;
    let nil = AtomTable::new().resolve("nil").ok_or_else(|| anyhow::anyhow!("nil atom"))?;

    let value = Value::map([
        ("a", Value::Int(1)),
        ("b", Value::List(vec![Value::Bool(true), Value::Atom(nil), Value::Float(3.5)])),
    ]);
    let echoed = bridge.call_dynamic("json.loads", vec![value.clone()], Kwargs::new(), CallOptions::new()).await?;

    assert_eq!(echoed, value);
    assert_eq!(pool.calls().len(), 1);
    Ok(())
}

// --- Test 2: Unwrapped Host Objects Never Reach The Wire ---

#[tokio::test]
async fn test_opaque_argument_rejected_locally() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::echo(1));
    let bridge = bridge(&pool)?;

    let result = bridge
        .call_dynamic(
            "builtins.print",
            vec![Value::Opaque(TypeHint::new("host", "Socket"))],
            Kwargs::new(),
            CallOptions::new(),
        )
        .await;

    assert!(matches!(result, Err(Error::Wire(WireError::UnwrappedObject { .. }))));
    assert!(pool.calls().is_empty());
    Ok(())
}

// --- Test 3: Refs Cannot Cross Sessions ---

#[tokio::test]
async fn test_ref_session_mismatch() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;
    let owner = bridge.open_detached_session(SessionOptions::default());
    let other = bridge.open_detached_session(SessionOptions::default());

    let (args, kwargs) = no_args();
    let handle = as_ref(owner.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;
    let sent = pool.calls().len();

    let (args, kwargs) = no_args();
    let result = other.call_method(&handle, "size", args, kwargs, CallOptions::new()).await;
    assert!(matches!(
        result,
        Err(Error::RefSessionMismatch { owner: ref o, .. }) if o == owner.id()
    ));

    // Passing the ref as an argument is caught the same way.
    let result = other
        .call_dynamic("builtins.id", vec![Value::Ref(handle.clone())], Kwargs::new(), CallOptions::new())
        .await;
    assert!(matches!(result, Err(Error::RefSessionMismatch { .. })));
    assert_eq!(pool.calls().len(), sent);
    Ok(())
}

// --- Test 4: Owner Termination Releases Remote Objects ---

#[tokio::test]
async fn test_owner_death_reclaims_objects() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;

    let (guard, owner) = OwnerHandle::pair();
    let scope = bridge.open_session(SessionOptions::default(), owner);
    let (args, kwargs) = no_args();
    let handle = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;
    assert_eq!(pool.live_objects(), 1);
    assert_eq!(scope.info()?.ref_count, 1);

    drop(guard);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!scope.exists());
    assert!(pool.released().contains(&handle.id));
    assert_eq!(pool.live_objects(), 0);

    let (args, kwargs) = no_args();
    let result = scope.call_method(&handle, "size", args, kwargs, CallOptions::new()).await;
    assert!(matches!(result, Err(Error::SessionNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_owner_task_completion_releases_session() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(1, worker));
    let bridge = bridge(&pool)?;

    let task = tokio::spawn(async { tokio::time::sleep(Duration::from_millis(20)).await });
    let scope = bridge.open_session(SessionOptions::default(), OwnerHandle::from_task(task));
    assert!(scope.exists());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!scope.exists());
    Ok(())
}

#[tokio::test]
async fn test_explicit_release_is_idempotent() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default());

    let (args, kwargs) = no_args();
    let first = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;
    let (args, kwargs) = no_args();
    let second = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;

    bridge.release_ref(&first).await?;
    bridge.release_ref(&first).await?;
    assert_eq!(pool.released(), vec![first.id.clone()]);

    assert!(scope.release().await);
    assert!(!scope.release().await);
    assert_eq!(pool.released(), vec![first.id, second.id]);
    Ok(())
}

// --- Test 5: Arity Checked Before Dispatch ---

#[tokio::test]
async fn test_arity_validation() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::echo(1));
    let bridge = bridge(&pool)?;

    let result = bridge.call("geo", "span", vec![Value::Int(1)], Kwargs::new(), CallOptions::new()).await;
    assert!(matches!(result, Err(Error::ArityNotSupported { given: 1, min: 2, .. })));

    let five = (0..5).map(Value::from).collect();
    let result = bridge.call("geo", "span", five, Kwargs::new(), CallOptions::new()).await;
    assert!(matches!(result, Err(Error::ArityNotSupported { given: 5, .. })));

    let result = bridge.call("stats", "mean", vec![Value::Int(1)], Kwargs::new(), CallOptions::new()).await;
    assert!(matches!(result, Err(Error::MissingRequiredKeyword { ref keyword, .. }) if keyword == "axis"));

    let result = bridge.call("geo", "nope", Vec::new(), Kwargs::new(), CallOptions::new()).await;
    assert!(matches!(result, Err(Error::NotDeclared(_))));
    assert!(pool.calls().is_empty());

    let three = (0..3).map(Value::from).collect();
    assert_eq!(bridge.call("geo", "span", three, Kwargs::new(), CallOptions::new()).await?, Value::Int(0));
    Ok(())
}

// --- Test 6: Undeclared Types Accept Variadic Calls ---

#[tokio::test]
async fn test_variadic_methods_on_undeclared_types() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(1, |call| {
        if call.target() == "numpy.array" {
            MockReply::object("numpy", "ndarray")
        } else {
            MockReply::value(WireValue::Int(call.envelope.args.len() as i64))
        }
    }));
    let bridge = bridge(&pool)?;

    let many: Vec<Value> = (0..12).map(Value::from).collect();
    let array = as_ref(bridge.call_dynamic("numpy.array", many, Kwargs::new(), CallOptions::new()).await?)?;
    assert_eq!(array.remote_type.as_deref(), Some("ndarray"));

    let eight: Vec<Value> = (0..8).map(Value::from).collect();
    let counted = bridge.call_method(&array, "reshape", eight, Kwargs::new(), CallOptions::new()).await?;
    assert_eq!(counted, Value::Int(8));

    let nine: Vec<Value> = (0..9).map(Value::from).collect();
    let result = bridge.call_method(&array, "reshape", nine, Kwargs::new(), CallOptions::new()).await;
    assert!(matches!(result, Err(Error::ArityNotSupported { given: 9, .. })));
    Ok(())
}

// --- Test 7: Affinity Policies Under Contention ---

#[tokio::test]
async fn test_hint_reroute_detects_stale_ref() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default());
    let (args, kwargs) = no_args();
    let handle = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;
    let home = pool.holder(&handle.id).ok_or_else(|| anyhow::anyhow!("object not held"))?;

    let (slow, hinted) = tokio::join!(
        scope.call_method(&handle, "slow", Vec::new(), Kwargs::new(), CallOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scope
                .call_method(&handle, "size", Vec::new(), Kwargs::new(), CallOptions::new().policy(AffinityPolicy::Hint))
                .await
        },
    );

    assert_eq!(slow?, Value::Str("done".into()));
    assert!(matches!(
        hinted,
        Err(Error::StaleRef { reason: StaleReason::WorkerMismatch { bound, .. }, .. }) if bound == home
    ));
    Ok(())
}

#[tokio::test]
async fn test_strict_queue_waits_for_home_worker() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default());
    let (args, kwargs) = no_args();
    let handle = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;
    let home = pool.holder(&handle.id).ok_or_else(|| anyhow::anyhow!("object not held"))?;

    let started = Instant::now();
    let (slow, queued) = tokio::join!(
        scope.call_method(&handle, "slow", Vec::new(), Kwargs::new(), CallOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scope.call_method(&handle, "size", Vec::new(), Kwargs::new(), CallOptions::new()).await
        },
    );

    slow?;
    queued?;
    assert!(started.elapsed() >= Duration::from_millis(350));
    assert!(pool.calls().iter().all(|call| call.worker == home));
    Ok(())
}

#[tokio::test]
async fn test_fail_fast_returns_busy() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default().policy(AffinityPolicy::StrictFailFast));
    let (args, kwargs) = no_args();
    let handle = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;

    let (slow, busy) = tokio::join!(
        scope.call_method(&handle, "slow", Vec::new(), Kwargs::new(), CallOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let attempted = Instant::now();
            let result = scope.call_method(&handle, "size", Vec::new(), Kwargs::new(), CallOptions::new()).await;
            (result, attempted.elapsed())
        },
    );

    slow?;
    let (result, waited) = busy;
    assert!(matches!(result, Err(Error::WorkerBusy { worker: Some(_), .. })));
    assert!(waited < Duration::from_millis(200));
    Ok(())
}

// --- Test 8: Crash Retry For Idempotent Calls ---

#[tokio::test]
async fn test_idempotent_call_retried_on_other_worker() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::echo(2));
    let bridge = bridge(&pool)?;

    pool.crash_next(1);
    let value = bridge
        .call_dynamic("math.floor", vec![Value::Int(7)], Kwargs::new(), CallOptions::new().idempotent())
        .await?;

    assert_eq!(value, Value::Int(7));
    let calls = pool.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].worker, calls[1].worker);
    assert_eq!(calls[0].envelope.call_id, calls[1].envelope.call_id);
    Ok(())
}

#[tokio::test]
async fn test_non_idempotent_crash_is_surfaced() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::echo(2));
    let bridge = bridge(&pool)?;

    pool.crash_next(1);
    let result = bridge.call_dynamic("os.remove", vec![Value::from("x")], Kwargs::new(), CallOptions::new()).await;

    assert!(matches!(result, Err(Error::WorkerCrashed { retried: false, .. })));
    assert_eq!(pool.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_crash_marks_refs_lost() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default());
    let (args, kwargs) = no_args();
    let handle = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;
    let home = pool.holder(&handle.id).ok_or_else(|| anyhow::anyhow!("object not held"))?;

    pool.crash_next(1);
    let result = scope.call_dynamic("gc.collect", Vec::new(), Kwargs::new(), CallOptions::new()).await;
    assert!(matches!(result, Err(Error::WorkerCrashed { worker, .. }) if worker == home));

    let (args, kwargs) = no_args();
    let result = scope.call_method(&handle, "size", args, kwargs, CallOptions::new()).await;
    assert!(matches!(
        result,
        Err(Error::StaleRef { reason: StaleReason::WorkerLost(lost), .. }) if lost == home
    ));
    Ok(())
}

// --- Test 9: Timeouts, Cancellation And Taint ---

#[tokio::test]
async fn test_uncancellable_timeout_taints_session() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker));
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default());
    let (args, kwargs) = no_args();
    let handle = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;

    let result = scope
        .call_method(&handle, "slow", Vec::new(), Kwargs::new(), CallOptions::new().timeout(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
    assert!(scope.info()?.tainted);

    // Hint would reroute, but the taint pins the session to the busy worker.
    let started = Instant::now();
    let value = scope
        .call_dynamic(
            "builtins.len",
            vec![Value::Int(3)],
            Kwargs::new(),
            CallOptions::new().policy(AffinityPolicy::Hint).timeout(Duration::from_secs(2)),
        )
        .await?;
    assert_eq!(value, Value::Int(3));
    assert!(started.elapsed() >= Duration::from_millis(200));

    let calls = pool.calls();
    assert_eq!(calls[1].worker, calls[2].worker);
    assert!(!scope.info()?.tainted);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_timeout_leaves_session_clean() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(2, worker).cancellable());
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default());
    let (args, kwargs) = no_args();
    let handle = as_ref(scope.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;

    let result = scope
        .call_method(&handle, "slow", Vec::new(), Kwargs::new(), CallOptions::new().timeout(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
    assert!(!scope.info()?.tainted);

    let started = Instant::now();
    let (args, kwargs) = no_args();
    scope.call_method(&handle, "size", args, kwargs, CallOptions::new()).await?;
    assert!(started.elapsed() < Duration::from_millis(200));
    Ok(())
}

// --- Test 10: Remote Exceptions ---

#[tokio::test]
async fn test_remote_errors_are_translated() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(1, |call| match call.target().as_str() {
        "torch.zeros" => MockReply::failure(
            RemoteErrorPayload::new("torch.cuda.OutOfMemoryError", "CUDA out of memory")
                .with_detail("device", "cuda:0")
                .with_detail("requested_bytes", 1_u64 << 30),
        ),
        _ => MockReply::error("builtins.ValueError", "invalid literal"),
    }));
    let bridge = bridge(&pool)?;
    let scope = bridge.open_detached_session(SessionOptions::default());

    let result = scope.call_dynamic("torch.zeros", Vec::new(), Kwargs::new(), CallOptions::new()).await;
    let Err(Error::Remote(RemoteFailure::OutOfMemory { device, requested_bytes, .. })) = result else {
        anyhow::bail!("expected an out-of-memory failure");
    };
    assert_eq!(device.as_deref(), Some("cuda:0"));
    assert_eq!(requested_bytes, Some(1 << 30));

    let first = scope.call_dynamic("builtins.int", Vec::new(), Kwargs::new(), CallOptions::new()).await;
    let second = scope.call_dynamic("builtins.int", Vec::new(), Kwargs::new(), CallOptions::new()).await;
    let (Err(Error::Remote(RemoteFailure::Other { kind: a, .. })), Err(Error::Remote(RemoteFailure::Other { kind: b, .. }))) =
        (first, second)
    else {
        anyhow::bail!("expected derived remote kinds");
    };
    assert_eq!(a.as_str(), "ValueError");
    assert!(a.ptr_eq(&b));

    // Failed calls do not move the session's affinity.
    assert_eq!(scope.info()?.last_worker, None);
    Ok(())
}

// --- Test 11: Ambient Session Scope ---

#[tokio::test]
async fn test_with_session_scope() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::echo(1));
    let bridge = bridge(&pool)?;
    assert!(Bridge::current_session().is_none());

    let inner = bridge.clone();
    let id = bridge
        .with_session(SessionOptions::default(), |scope| async move {
            assert_eq!(Bridge::current_session().as_ref(), Some(scope.id()));
            inner
                .call_dynamic("builtins.abs", vec![Value::Int(-1)], Kwargs::new(), CallOptions::new())
                .await
                .map(|_| scope.id().clone())
        })
        .await?;

    assert_eq!(pool.calls()[0].envelope.session_id, id);
    assert!(!bridge.session_exists(&id));
    assert!(Bridge::current_session().is_none());
    Ok(())
}

#[tokio::test]
async fn test_default_session_recreated_after_release() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::echo(1));
    let bridge = bridge(&pool)?;

    bridge.call_dynamic("builtins.abs", vec![Value::Int(1)], Kwargs::new(), CallOptions::new()).await?;
    let first = bridge.default_session();
    assert_eq!(pool.calls()[0].envelope.session_id, first);

    assert!(bridge.release_session(&first).await);
    bridge.call_dynamic("builtins.abs", vec![Value::Int(1)], Kwargs::new(), CallOptions::new()).await?;
    let second = bridge.default_session();
    assert_ne!(first, second);
    assert_eq!(pool.calls()[1].envelope.session_id, second);
    Ok(())
}

// --- Test 12: Attributes ---

#[tokio::test]
async fn test_attribute_access() -> anyhow::Result<()> {
    let pool = Arc::new(MockPool::new(1, worker));
    let bridge = bridge(&pool)?;

    let pi = bridge.get_attr(AttrTarget::Module("math"), "pi", CallOptions::new()).await?;
    assert_eq!(pi, Value::Float(3.25));

    let result = bridge.get_attr(AttrTarget::Module("math"), "tau", CallOptions::new()).await;
    assert!(matches!(result, Err(Error::NotDeclared(_))));

    let result = bridge.set_attr(AttrTarget::Module("math"), "pi", Value::Int(3), CallOptions::new()).await;
    assert!(matches!(result, Err(Error::ReadOnlyAttribute { .. })));
    assert_eq!(pool.calls().len(), 1);

    let (args, kwargs) = no_args();
    let handle = as_ref(bridge.construct("shapes", "Box", args, kwargs, CallOptions::new()).await?)?;
    bridge.set_attr(AttrTarget::Ref(&handle), "width", Value::Int(4), CallOptions::new()).await?;
    let last = pool.calls().pop().ok_or_else(|| anyhow::anyhow!("no call recorded"))?;
    assert_eq!(last.arg(0), Some(&WireValue::Int(4)));
    Ok(())
}

// --- Test 13: Builder Validation ---

#[tokio::test]
async fn test_builder_rejects_unknown_protocol_version() {
    let pool = Arc::new(MockPool::echo(1));
    let result = Bridge::builder(pool).config(|c| c.protocol_version = 99).build();
    assert!(matches!(result, Err(Error::ProtocolVersionUnsupported { found: 99, .. })));

    let empty = Arc::new(MockPool::echo(0));
    assert!(matches!(Bridge::builder(empty).build(), Err(Error::NoWorkers)));
}

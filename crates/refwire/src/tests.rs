use std::collections::BTreeMap;

use serde_json::json;

use crate::*;

fn session() -> SessionId {
    SessionId::new("s-1")
}

fn roundtrip(codec: &Codec, value: &Value) -> Value {
    let wire = codec.encode(value).expect("encode");
    let bytes = serde_json::to_vec(&wire.to_json().expect("to_json")).expect("serialize");
    let json: serde_json::Value = serde_json::from_slice(&bytes).expect("parse");
    let back = WireValue::from_json(&json).expect("from_json");
    codec.decode(&back, &session()).expect("decode")
}

// ============================================================================
//  VALUES
// ============================================================================

#[test]
fn test_scalars_roundtrip() {
    let codec = Codec::default();
    for value in [
        Value::Null,
        Value::Bool(true),
        Value::Int(i64::MIN),
        Value::Int(i64::MAX),
        Value::Float(3.5),
        Value::Str("héllo".into()),
    ] {
        assert_eq!(roundtrip(&codec, &value), value);
    }
}

#[test]
fn test_special_floats_are_tagged() {
    let codec = Codec::default();
    let wire = codec.encode(&Value::Float(f64::NEG_INFINITY)).unwrap();
    assert_eq!(
        wire.to_json().unwrap(),
        json!({"__type__": "special_float", "__schema__": 1, "value": "neg_infinity"})
    );

    assert_eq!(roundtrip(&codec, &Value::Float(f64::INFINITY)), Value::Float(f64::INFINITY));
    match roundtrip(&codec, &Value::Float(f64::NAN)) {
        Value::Float(f) => assert!(f.is_nan()),
        other => panic!("expected NaN, got {:?}", other),
    }
}

#[test]
fn test_legacy_special_float_tag() {
    let wire = WireValue::from_json(&json!({"__type__": "infinity"})).unwrap();
    assert_eq!(wire, WireValue::SpecialFloat(SpecialFloat::Infinity));
}

#[test]
fn test_bytes_tuple_and_nested_containers() {
    let codec = Codec::default();
    let value = Value::map([
        ("raw", Value::Bytes(vec![0, 159, 255])),
        ("pair", Value::Tuple(vec![Value::Int(1), Value::Str("x".into())])),
        ("list", Value::List(vec![Value::Bool(true), Value::Null, Value::Float(3.5)])),
    ]);
    assert_eq!(roundtrip(&codec, &value), value);
}

#[test]
fn test_legacy_bytes_and_tuple_fields() {
    let bytes = WireValue::from_json(&json!({"__type__": "bytes", "value": "AAE="})).unwrap();
    assert_eq!(bytes, WireValue::Bytes(vec![0, 1]));

    let tuple = WireValue::from_json(&json!({"__type__": "tuple", "value": [1, "a"]})).unwrap();
    assert_eq!(tuple, WireValue::Tuple(vec![WireValue::Int(1), WireValue::Str("a".into())]));
}

#[test]
fn test_atoms_respect_allow_list() {
    let mut atoms = AtomTable::new();
    let ready = atoms.allow("ready");
    let codec = Codec::new(atoms);

    let known = WireValue::Atom("ready".into());
    assert_eq!(codec.decode(&known, &session()).unwrap(), Value::Atom(ready));

    let unknown = WireValue::Atom("surprise".into());
    assert_eq!(codec.decode(&unknown, &session()).unwrap(), Value::Str("surprise".into()));
    assert!(!codec.atoms().contains("surprise"));
}

#[test]
fn test_opaque_values_are_never_stringified() {
    let codec = Codec::default();
    let value = Value::List(vec![Value::Opaque(TypeHint::new("numpy", "ndarray"))]);
    let wire = codec.encode(&value).unwrap();

    let err = wire.to_json().unwrap_err();
    assert!(matches!(err, WireError::UnwrappedObject { ref type_name, .. } if type_name == "ndarray"));
}

#[test]
fn test_wrap_refs_replaces_needs_ref() {
    let codec = Codec::default();
    let value = Value::map([("obj", Value::Opaque(TypeHint::new("pkg", "Thing")))]);
    let wire = codec.encode(&value).unwrap().wrap_refs(&mut |hint| WireRef {
        id: RefId::new("r-9"),
        session_id: Some(session()),
        module: hint.module,
        type_name: Some(hint.type_name),
    });

    let decoded = codec.decode(&wire, &session()).unwrap();
    let Value::Map(entries) = decoded else { panic!("expected a map") };
    let r = entries["obj"].as_ref_handle().expect("ref");
    assert_eq!(r.id.as_str(), "r-9");
    assert_eq!(r.remote_type.as_deref(), Some("Thing"));
}

#[test]
fn test_needs_ref_marker_from_peer_is_rejected() {
    let err = WireValue::from_json(&json!({"__needs_ref__": true, "__type_name__": "Foo"})).unwrap_err();
    assert!(matches!(err, WireError::UnwrappedObject { .. }));
}

// ============================================================================
//  REFS
// ============================================================================

#[test]
fn test_ref_roundtrip_keeps_identity() {
    let codec = Codec::default();
    let r = Ref::new(RefId::new("abc"), session(), "collections", Some("Counter".into()));
    assert_eq!(roundtrip(&codec, &Value::Ref(r.clone())), Value::Ref(r));
}

#[test]
fn test_legacy_ref_fields_bind_to_decoding_session() {
    let codec = Codec::default();
    let json = json!({"__type__": "ref", "ref_id": "old-1", "python_module": "m", "python_class": "C"});
    let wire = WireValue::from_json(&json).unwrap();
    let value = codec.decode(&wire, &session()).unwrap();

    let r = value.as_ref_handle().expect("ref");
    assert_eq!(r.session_id, session());
    assert_eq!(r.remote_module, "m");
}

#[test]
fn test_foreign_ref_is_rejected() {
    let codec = Codec::default();
    let r = Ref::new(RefId::new("abc"), SessionId::new("other"), "m", None);
    let wire = codec.encode(&Value::Ref(r)).unwrap();

    let err = codec.decode(&wire, &session()).unwrap_err();
    assert!(matches!(err, WireError::ForeignRef { .. }));
}

// ============================================================================
//  VERSIONING AND LIMITS
// ============================================================================

#[test]
fn test_newer_schema_is_rejected() {
    let err = WireValue::from_json(&json!({"__type__": "atom", "__schema__": 2, "value": "ok"})).unwrap_err();
    assert_eq!(err, WireError::SchemaUnsupported { found: 2, supported: 1 });
}

#[test]
fn test_unknown_tag_is_kept_as_map() {
    let wire = WireValue::from_json(&json!({"__type__": "mystery", "x": 1})).unwrap();
    let WireValue::Map(entries) = wire else { panic!("expected a map") };
    assert_eq!(entries["x"], WireValue::Int(1));
}

#[test]
fn test_integer_overflow_is_an_error() {
    let err = WireValue::from_json(&json!(u64::MAX)).unwrap_err();
    assert!(matches!(err, WireError::IntOutOfRange(_)));
}

#[test]
fn test_recursion_limit() {
    let mut value = Value::Null;
    for _ in 0..(MAX_DEPTH + 2) {
        value = Value::List(vec![value]);
    }
    let err = Codec::default().encode(&value).unwrap_err();
    assert_eq!(err, WireError::RecursionLimitExceeded(MAX_DEPTH));
}

// ============================================================================
//  ENVELOPES
// ============================================================================

fn sample_envelope() -> CallEnvelope {
    let mut env = CallEnvelope::new(
        7,
        session(),
        Target::Function { module: "math".into(), name: "pow".into() },
    );
    env.args = vec![WireValue::Int(2), WireValue::Int(10)];
    env.kwargs = BTreeMap::from([("mod".to_string(), WireValue::Int(1000))]);
    env.idempotent = true;
    env
}

#[test]
fn test_envelope_roundtrip() {
    let env = sample_envelope();
    let bytes = env.to_bytes().unwrap();
    assert_eq!(CallEnvelope::from_bytes(&bytes).unwrap(), env);
}

#[test]
fn test_envelope_ignores_unknown_keys() {
    let mut json = sample_envelope().to_json().unwrap();
    json["trace_context"] = json!({"span": 4});
    assert_eq!(CallEnvelope::from_json(&json).unwrap(), sample_envelope());
}

#[test]
fn test_envelope_version_gate() {
    let mut json = sample_envelope().to_json().unwrap();
    json["protocol_version"] = json!(PROTOCOL_VERSION + 1);
    let err = CallEnvelope::from_json(&json).unwrap_err();
    assert!(matches!(err, WireError::ProtocolVersionUnsupported { found, .. } if found == 2));

    json["protocol_version"] = json!(0);
    assert!(CallEnvelope::from_json(&json).is_err());
}

#[test]
fn test_envelope_unknown_call_type() {
    let mut json = sample_envelope().to_json().unwrap();
    json["call_type"] = json!("teleport");
    assert_eq!(
        CallEnvelope::from_json(&json).unwrap_err(),
        WireError::UnknownCallType("teleport".into())
    );
}

#[test]
fn test_method_envelope_collects_refs() {
    let receiver = WireRef {
        id: RefId::new("recv"),
        session_id: Some(session()),
        module: "m".into(),
        type_name: Some("C".into()),
    };
    let mut arg = receiver.clone();
    arg.id = RefId::new("arg");

    let mut env = CallEnvelope::new(1, session(), Target::Method { receiver, name: "push".into() });
    env.args = vec![WireValue::Seq(vec![WireValue::Ref(arg)])];

    let decoded = CallEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded.call_type(), CallType::Method);
    let refs = decoded.refs();
    let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["recv", "arg"]);
}

#[test]
fn test_call_type_tags() {
    for ty in [
        CallType::Function,
        CallType::Method,
        CallType::ClassInit,
        CallType::Dynamic,
        CallType::ModuleAttr,
        CallType::RefAttr,
        CallType::Release,
    ] {
        assert_eq!(CallType::from_tag(ty.as_tag()).unwrap(), ty);
    }
}

// ============================================================================
//  RESPONSES
// ============================================================================

#[test]
fn test_response_success_and_failure() {
    let ok = Response::success(3, WireValue::Str("done".into()));
    assert_eq!(Response::from_bytes(&ok.to_bytes().unwrap()).unwrap(), ok);

    let failure = RemoteErrorPayload::new("builtins.ValueError", "bad input").with_detail("arg", 1);
    let err = Response::failure(4, failure);
    assert_eq!(Response::from_bytes(&err.to_bytes().unwrap()).unwrap(), err);
}

#[test]
fn test_legacy_flat_error_response() {
    let json = json!({
        "success": false,
        "error": "division by zero",
        "error_type": "ZeroDivisionError",
        "traceback": "..."
    });
    let response = Response::from_json(&json).unwrap();
    assert_eq!(response.call_id, None);
    let Outcome::Failure(payload) = response.outcome else { panic!("expected failure") };
    assert_eq!(payload.kind, "ZeroDivisionError");
    assert_eq!(payload.message, "division by zero");
    assert!(payload.detail.contains_key("traceback"));
}

#[test]
fn test_legacy_success_without_version() {
    let response = Response::from_json(&json!({"success": true, "result": [1, 2]})).unwrap();
    assert_eq!(response.protocol_version, PROTOCOL_VERSION);
    assert_eq!(
        response.outcome,
        Outcome::Success(WireValue::Seq(vec![WireValue::Int(1), WireValue::Int(2)]))
    );
}

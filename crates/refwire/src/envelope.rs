//! # Protocol Frames
//!
//! Defines the call envelope and the response frame exchanged with a worker.
//!
//! ```text
//! call:     {protocol_version, call_id, call_type, session_id, target, args, kwargs, idempotent}
//! response: {protocol_version, call_id, success: true,  result}
//!           {protocol_version, call_id, success: false, error: {kind, message, detail}}
//! ```
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown top-level keys are ignored.
//! - **Version Gate**: A `protocol_version` outside the supported range is a hard
//!   rejection, never a best-effort parse.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as Json;

use crate::error::Result;
use crate::error::WireError;
use crate::value::SessionId;
use crate::wire::WireRef;
use crate::wire::WireValue;

/// Protocol version written by this crate.
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest protocol version still accepted on decode.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// The closed set of call shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallType {
    Function,
    Method,
    ClassInit,
    Dynamic,
    ModuleAttr,
    RefAttr,
    Release,
}

impl CallType {
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::ClassInit => "class_init",
            Self::Dynamic => "dynamic",
            Self::ModuleAttr => "module_attr",
            Self::RefAttr => "ref_attr",
            Self::Release => "release",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "function" => Ok(Self::Function),
            "method" => Ok(Self::Method),
            "class_init" => Ok(Self::ClassInit),
            "dynamic" => Ok(Self::Dynamic),
            "module_attr" => Ok(Self::ModuleAttr),
            "ref_attr" => Ok(Self::RefAttr),
            "release" => Ok(Self::Release),
            other => Err(WireError::UnknownCallType(other.to_string())),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Whether a `RefAttr` call reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrOp {
    Get,
    Set,
}

/// What a call is aimed at. One variant per `CallType`.
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    Function { module: String, name: String },
    Method { receiver: WireRef, name: String },
    ClassInit { module: String, class: String },
    /// Raw dotted path; bypasses every declared-arity table.
    Dynamic { path: String },
    /// Read-only attribute or constant of a module.
    ModuleAttr { module: String, attr: String },
    RefAttr { receiver: WireRef, attr: String, op: AttrOp },
    /// Bulk release; the refs travel in `args`.
    Release,
}

impl Target {
    pub fn call_type(&self) -> CallType {
        match self {
            Self::Function { .. } => CallType::Function,
            Self::Method { .. } => CallType::Method,
            Self::ClassInit { .. } => CallType::ClassInit,
            Self::Dynamic { .. } => CallType::Dynamic,
            Self::ModuleAttr { .. } => CallType::ModuleAttr,
            Self::RefAttr { .. } => CallType::RefAttr,
            Self::Release => CallType::Release,
        }
    }

    /// The ref this call is made on, if any.
    pub fn receiver(&self) -> Option<&WireRef> {
        match self {
            Self::Method { receiver, .. } | Self::RefAttr { receiver, .. } => Some(receiver),
            _ => None,
        }
    }

    fn to_json(&self) -> Result<Json> {
        let mut map = Map::new();
        match self {
            Self::Function { module, name } => {
                map.insert("module".into(), Json::from(module.as_str()));
                map.insert("function".into(), Json::from(name.as_str()));
            }
            Self::Method { receiver, name } => {
                map.insert("ref".into(), WireValue::Ref(receiver.clone()).to_json()?);
                map.insert("method".into(), Json::from(name.as_str()));
            }
            Self::ClassInit { module, class } => {
                map.insert("module".into(), Json::from(module.as_str()));
                map.insert("class".into(), Json::from(class.as_str()));
            }
            Self::Dynamic { path } => {
                map.insert("path".into(), Json::from(path.as_str()));
            }
            Self::ModuleAttr { module, attr } => {
                map.insert("module".into(), Json::from(module.as_str()));
                map.insert("attr".into(), Json::from(attr.as_str()));
            }
            Self::RefAttr { receiver, attr, op } => {
                map.insert("ref".into(), WireValue::Ref(receiver.clone()).to_json()?);
                map.insert("attr".into(), Json::from(attr.as_str()));
                let op = match op {
                    AttrOp::Get => "get",
                    AttrOp::Set => "set",
                };
                map.insert("op".into(), Json::from(op));
            }
            Self::Release => {}
        }
        Ok(Json::Object(map))
    }

    fn from_json(call_type: CallType, json: &Json) -> Result<Self> {
        let map = json
            .as_object()
            .ok_or(WireError::Malformed { what: "target", details: "expected an object".into() })?;

        let target = match call_type {
            CallType::Function => Self::Function {
                module: req_str(map, "module")?,
                name: req_str(map, "function")?,
            },
            CallType::Method => Self::Method {
                receiver: req_ref(map)?,
                name: req_str(map, "method")?,
            },
            CallType::ClassInit => Self::ClassInit {
                module: req_str(map, "module")?,
                class: req_str(map, "class")?,
            },
            CallType::Dynamic => Self::Dynamic { path: req_str(map, "path")? },
            CallType::ModuleAttr => Self::ModuleAttr {
                module: req_str(map, "module")?,
                attr: req_str(map, "attr")?,
            },
            CallType::RefAttr => Self::RefAttr {
                receiver: req_ref(map)?,
                attr: req_str(map, "attr")?,
                op: match map.get("op").and_then(Json::as_str) {
                    Some("set") => AttrOp::Set,
                    Some("get") | None => AttrOp::Get,
                    Some(other) => {
                        return Err(WireError::Malformed { what: "attr op", details: other.to_string() });
                    }
                },
            },
            CallType::Release => Self::Release,
        };
        Ok(target)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function { module, name } => write!(f, "{}.{}", module, name),
            Self::Method { receiver, name } => write!(f, "<{}>.{}", receiver.id, name),
            Self::ClassInit { module, class } => write!(f, "{}.{}()", module, class),
            Self::Dynamic { path } => write!(f, "{}", path),
            Self::ModuleAttr { module, attr } => write!(f, "{}.{}", module, attr),
            Self::RefAttr { receiver, attr, .. } => write!(f, "<{}>.{}", receiver.id, attr),
            Self::Release => write!(f, "<release>"),
        }
    }
}

/// One call, fully described. Built per call and never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct CallEnvelope {
    pub call_id: u64,
    pub session_id: SessionId,
    pub target: Target,
    pub args: Vec<WireValue>,
    pub kwargs: BTreeMap<String, WireValue>,
    pub protocol_version: u32,
    pub idempotent: bool,
}

impl CallEnvelope {
    pub fn new(call_id: u64, session_id: SessionId, target: Target) -> Self {
        Self {
            call_id,
            session_id,
            target,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            protocol_version: PROTOCOL_VERSION,
            idempotent: false,
        }
    }

    pub fn call_type(&self) -> CallType {
        self.target.call_type()
    }

    /// Every ref carried by this call: the receiver first, then any nested in arguments.
    pub fn refs(&self) -> Vec<&WireRef> {
        let mut refs: Vec<&WireRef> = self.target.receiver().into_iter().collect();
        for value in self.args.iter().chain(self.kwargs.values()) {
            collect_refs(value, &mut refs);
        }
        refs
    }

    pub fn to_json(&self) -> Result<Json> {
        let mut map = Map::new();
        map.insert("protocol_version".into(), Json::from(self.protocol_version));
        map.insert("call_id".into(), Json::from(self.call_id));
        map.insert("call_type".into(), Json::from(self.call_type().as_tag()));
        map.insert("session_id".into(), Json::from(self.session_id.as_str()));
        map.insert("target".into(), self.target.to_json()?);
        map.insert(
            "args".into(),
            Json::Array(self.args.iter().map(WireValue::to_json).collect::<Result<_>>()?),
        );
        let mut kwargs = Map::new();
        for (k, v) in &self.kwargs {
            kwargs.insert(k.clone(), v.to_json()?);
        }
        map.insert("kwargs".into(), Json::Object(kwargs));
        map.insert("idempotent".into(), Json::Bool(self.idempotent));
        Ok(Json::Object(map))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_json()?)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let json: Json = serde_json::from_slice(bytes)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &Json) -> Result<Self> {
        let map = json
            .as_object()
            .ok_or(WireError::Malformed { what: "envelope", details: "expected an object".into() })?;

        let protocol_version = map
            .get("protocol_version")
            .and_then(Json::as_u64)
            .ok_or(WireError::MissingField("protocol_version"))?;
        let protocol_version = check_protocol(protocol_version)?;

        let call_type = CallType::from_tag(&req_str(map, "call_type")?)?;
        let call_id = map
            .get("call_id")
            .and_then(Json::as_u64)
            .ok_or(WireError::MissingField("call_id"))?;
        let session_id = SessionId::new(req_str(map, "session_id")?);
        let target = Target::from_json(
            call_type,
            map.get("target").ok_or(WireError::MissingField("target"))?,
        )?;

        let args = match map.get("args") {
            Some(Json::Array(items)) => items.iter().map(WireValue::from_json).collect::<Result<_>>()?,
            Some(Json::Null) | None => Vec::new(),
            Some(_) => return Err(WireError::Malformed { what: "args", details: "expected a list".into() }),
        };

        let mut kwargs = BTreeMap::new();
        match map.get("kwargs") {
            Some(Json::Object(entries)) => {
                for (k, v) in entries {
                    kwargs.insert(k.clone(), WireValue::from_json(v)?);
                }
            }
            Some(Json::Null) | None => {}
            Some(_) => return Err(WireError::Malformed { what: "kwargs", details: "expected a map".into() }),
        }

        let idempotent = map.get("idempotent").and_then(Json::as_bool).unwrap_or(false);

        Ok(Self { call_id, session_id, target, args, kwargs, protocol_version, idempotent })
    }
}

/// A structured remote failure: `{kind, message, detail}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorPayload {
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub detail: Map<String, Json>,
}

impl RemoteErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into(), detail: Map::new() }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// The result side of a response frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success(WireValue),
    Failure(RemoteErrorPayload),
}

/// A worker's answer to one `CallEnvelope`.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Absent in replies from legacy workers.
    pub call_id: Option<u64>,
    pub protocol_version: u32,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(call_id: u64, result: WireValue) -> Self {
        Self { call_id: Some(call_id), protocol_version: PROTOCOL_VERSION, outcome: Outcome::Success(result) }
    }

    pub fn failure(call_id: u64, error: RemoteErrorPayload) -> Self {
        Self { call_id: Some(call_id), protocol_version: PROTOCOL_VERSION, outcome: Outcome::Failure(error) }
    }

    pub fn to_json(&self) -> Result<Json> {
        let mut map = Map::new();
        map.insert("protocol_version".into(), Json::from(self.protocol_version));
        if let Some(call_id) = self.call_id {
            map.insert("call_id".into(), Json::from(call_id));
        }
        match &self.outcome {
            Outcome::Success(result) => {
                map.insert("success".into(), Json::Bool(true));
                map.insert("result".into(), result.to_json()?);
            }
            Outcome::Failure(error) => {
                map.insert("success".into(), Json::Bool(false));
                map.insert("error".into(), serde_json::to_value(error)?);
            }
        }
        Ok(Json::Object(map))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_json()?)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let json: Json = serde_json::from_slice(bytes)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &Json) -> Result<Self> {
        let map = json
            .as_object()
            .ok_or(WireError::Malformed { what: "response", details: "expected an object".into() })?;

        let protocol_version = match map.get("protocol_version") {
            Some(v) => check_protocol(
                v.as_u64().ok_or(WireError::Malformed { what: "protocol_version", details: v.to_string() })?,
            )?,
            None => PROTOCOL_VERSION,
        };
        let call_id = map.get("call_id").and_then(Json::as_u64);

        let success = match map.get("success").and_then(Json::as_bool) {
            Some(flag) => flag,
            None => !map.contains_key("error"),
        };

        let outcome = if success {
            let result = map.get("result").map(WireValue::from_json).transpose()?;
            Outcome::Success(result.unwrap_or(WireValue::Null))
        } else {
            Outcome::Failure(decode_error(map)?)
        };

        Ok(Self { call_id, protocol_version, outcome })
    }
}

/// Accepts `{error: {kind, message, detail}}` and the legacy flat
/// `{error: "message", error_type: "ValueError", traceback}` layout.
fn decode_error(map: &Map<String, Json>) -> Result<RemoteErrorPayload> {
    match map.get("error") {
        Some(Json::Object(_)) => {
            let error = map.get("error").cloned().unwrap_or(Json::Null);
            serde_json::from_value(error)
                .map_err(|e| WireError::Malformed { what: "error", details: e.to_string() })
        }
        other => {
            let message = other.and_then(Json::as_str).unwrap_or_default();
            let kind = map.get("error_type").and_then(Json::as_str).unwrap_or("RemoteError");
            let mut payload = RemoteErrorPayload::new(kind, message);
            if let Some(traceback) = map.get("traceback") {
                payload.detail.insert("traceback".into(), traceback.clone());
            }
            Ok(payload)
        }
    }
}

fn check_protocol(found: u64) -> Result<u32> {
    if found < MIN_PROTOCOL_VERSION as u64 || found > PROTOCOL_VERSION as u64 {
        return Err(WireError::ProtocolVersionUnsupported {
            found,
            min: MIN_PROTOCOL_VERSION,
            max: PROTOCOL_VERSION,
        });
    }
    Ok(found as u32)
}

fn req_str(map: &Map<String, Json>, key: &'static str) -> Result<String> {
    map.get(key)
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or(WireError::MissingField(key))
}

fn req_ref(map: &Map<String, Json>) -> Result<WireRef> {
    let json = map.get("ref").ok_or(WireError::MissingField("ref"))?;
    match WireValue::from_json(json)? {
        WireValue::Ref(r) => Ok(r),
        _ => Err(WireError::Malformed { what: "ref", details: "receiver is not ref-shaped".into() }),
    }
}

fn collect_refs<'a>(value: &'a WireValue, out: &mut Vec<&'a WireRef>) {
    match value {
        WireValue::Ref(r) => out.push(r),
        WireValue::Seq(items) | WireValue::Tuple(items) => {
            items.iter().for_each(|item| collect_refs(item, out));
        }
        WireValue::Map(entries) => entries.values().for_each(|item| collect_refs(item, out)),
        _ => {}
    }
}

//! # Host Values
//!
//! The host-native value model and the identifiers that tie remote objects to
//! the session that owns them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

/// Current version of the tagged-value schema written by this codec.
pub const SCHEMA_VERSION: u32 = 1;

/// Opaque session identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an object living inside a worker, assigned by the worker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefId(String);

impl RefId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A handle to an object that exists only inside a worker process.
///
/// A `Ref` is owned by the session that created it. Using it with any other
/// session is a protocol violation, never a silent re-homing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ref {
    pub id: RefId,
    pub session_id: SessionId,
    pub remote_module: String,
    pub remote_type: Option<String>,
    pub schema_version: u32,
}

impl Ref {
    pub fn new(
        id: RefId,
        session_id: SessionId,
        remote_module: impl Into<String>,
        remote_type: Option<String>,
    ) -> Self {
        Self {
            id,
            session_id,
            remote_module: remote_module.into(),
            remote_type,
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote_type {
            Some(ty) => write!(f, "#Ref<{}.{} {}>", self.remote_module, ty, self.id),
            None => write!(f, "#Ref<{} {}>", self.remote_module, self.id),
        }
    }
}

/// Describes the type of an object that has no wire representation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeHint {
    pub module: String,
    pub type_name: String,
}

impl TypeHint {
    pub fn new(module: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self { module: module.into(), type_name: type_name.into() }
    }
}

/// An interned symbol. Only produced from names on an `AtomTable` allow-list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(pub(crate) Arc<str>);

impl Atom {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// A host-native value.
///
/// `Opaque` stands for a host object with no fixed wire shape. It encodes to
/// `WireValue::NeedsRef`, so the boundary wraps it in a ref instead of
/// degrading it to a string.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Atom(Atom),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(Ref),
    Opaque(TypeHint),
}

impl Value {
    /// Builds a map value from key/value pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_ref_handle(&self) -> Option<&Ref> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Visits every ref nested anywhere inside this value.
    pub fn for_each_ref<'a>(&'a self, f: &mut impl FnMut(&'a Ref)) {
        match self {
            Value::Ref(r) => f(r),
            Value::List(items) | Value::Tuple(items) => {
                items.iter().for_each(|item| item.for_each_ref(f));
            }
            Value::Map(entries) => entries.values().for_each(|item| item.for_each_ref(f)),
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Value::List(v) }
}

impl From<Ref> for Value {
    fn from(v: Ref) -> Self { Value::Ref(v) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

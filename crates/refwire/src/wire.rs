//! # Wire Values
//!
//! The self-describing, JSON-shaped representation that crosses the process
//! boundary. Anything JSON cannot carry natively is a tagged map:
//!
//! ```text
//! {"__type__": "<tag>", "__schema__": 1, ...fields}
//! ```
//!
//! ## Invariants
//! - **No stringification**: `NeedsRef` never serializes; it is an error to try.
//! - **Recursion Safety**: conversions are bounded by `MAX_DEPTH`.
//! - **Tolerant decoding**: legacy field names are accepted here, once, so that
//!   call sites never branch on schema differences.

use std::collections::BTreeMap;

use base64::Engine;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as Json;

use crate::error::Result;
use crate::error::WireError;
use crate::value::RefId;
use crate::value::SessionId;
use crate::value::TypeHint;
use crate::value::SCHEMA_VERSION;

/// The maximum nesting depth for values before bailing out.
pub const MAX_DEPTH: usize = 64;

const TYPE_KEY: &str = "__type__";
const SCHEMA_KEY: &str = "__schema__";

/// Non-finite floats, which JSON cannot express as numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialFloat {
    Nan,
    Infinity,
    NegInfinity,
}

impl SpecialFloat {
    /// Classifies a float; `None` for finite values.
    pub fn classify(v: f64) -> Option<Self> {
        if v.is_nan() {
            Some(Self::Nan)
        } else if v == f64::INFINITY {
            Some(Self::Infinity)
        } else if v == f64::NEG_INFINITY {
            Some(Self::NegInfinity)
        } else {
            None
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Self::Nan => f64::NAN,
            Self::Infinity => f64::INFINITY,
            Self::NegInfinity => f64::NEG_INFINITY,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Nan => "nan",
            Self::Infinity => "infinity",
            Self::NegInfinity => "neg_infinity",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "nan" => Some(Self::Nan),
            "infinity" => Some(Self::Infinity),
            "neg_infinity" => Some(Self::NegInfinity),
            _ => None,
        }
    }
}

/// The wire shape of a remote reference.
///
/// `session_id` is optional on decode only: older workers omit it, in which
/// case the decoding session claims the ref.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRef {
    #[serde(alias = "ref_id")]
    pub id: RefId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default, alias = "python_module")]
    pub module: String,
    #[serde(default, alias = "python_class")]
    pub type_name: Option<String>,
}

/// A value as it appears on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    SpecialFloat(SpecialFloat),
    Str(String),
    Bytes(Vec<u8>),
    Atom(String),
    Seq(Vec<WireValue>),
    Tuple(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Ref(WireRef),
    /// Encoder signal: "wrap this in a ref". Never serialized.
    NeedsRef(TypeHint),
}

impl WireValue {
    /// Replaces every `NeedsRef` with the ref produced by `wrap`.
    ///
    /// This is the boundary step that turns an unrepresentable object into a
    /// handle the other side can call methods on.
    pub fn wrap_refs(self, wrap: &mut impl FnMut(TypeHint) -> WireRef) -> WireValue {
        match self {
            WireValue::NeedsRef(hint) => WireValue::Ref(wrap(hint)),
            WireValue::Seq(items) => {
                WireValue::Seq(items.into_iter().map(|item| item.wrap_refs(wrap)).collect())
            }
            WireValue::Tuple(items) => {
                WireValue::Tuple(items.into_iter().map(|item| item.wrap_refs(wrap)).collect())
            }
            WireValue::Map(entries) => WireValue::Map(
                entries.into_iter().map(|(k, v)| (k, v.wrap_refs(wrap))).collect(),
            ),
            other => other,
        }
    }

    /// Serializes into a JSON tree.
    ///
    /// # Errors
    /// Returns `WireError::UnwrappedObject` if a `NeedsRef` is still present.
    pub fn to_json(&self) -> Result<Json> {
        to_json_at(self, 0)
    }

    /// Parses a JSON tree, accepting legacy tag layouts.
    pub fn from_json(json: &Json) -> Result<WireValue> {
        from_json_at(json, 0)
    }
}

// ============================================================================
//  WIRE ENCODING
// ============================================================================

fn tagged(tag: &str, fields: impl IntoIterator<Item = (&'static str, Json)>) -> Json {
    let mut map = Map::new();
    map.insert(TYPE_KEY.into(), Json::from(tag));
    map.insert(SCHEMA_KEY.into(), Json::from(SCHEMA_VERSION));
    for (k, v) in fields {
        map.insert(k.into(), v);
    }
    Json::Object(map)
}

fn to_json_at(value: &WireValue, depth: usize) -> Result<Json> {
    if depth > MAX_DEPTH {
        return Err(WireError::RecursionLimitExceeded(MAX_DEPTH));
    }

    let json = match value {
        WireValue::Null => Json::Null,
        WireValue::Bool(b) => Json::Bool(*b),
        WireValue::Int(i) => Json::from(*i),
        WireValue::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(n) => Json::Number(n),
            // Non-finite floats that skipped classification still get a faithful tag.
            None => special_to_json(SpecialFloat::classify(*f).unwrap_or(SpecialFloat::Nan)),
        },
        WireValue::SpecialFloat(s) => special_to_json(*s),
        WireValue::Str(s) => Json::String(s.clone()),
        WireValue::Bytes(b) => tagged("bytes", [(
            "data",
            Json::String(base64::engine::general_purpose::STANDARD.encode(b)),
        )]),
        WireValue::Atom(name) => tagged("atom", [("value", Json::String(name.clone()))]),
        WireValue::Seq(items) => Json::Array(
            items.iter().map(|item| to_json_at(item, depth + 1)).collect::<Result<_>>()?,
        ),
        WireValue::Tuple(items) => {
            let elements = items
                .iter()
                .map(|item| to_json_at(item, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            tagged("tuple", [("elements", Json::Array(elements))])
        }
        WireValue::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(k.clone(), to_json_at(v, depth + 1)?);
            }
            Json::Object(map)
        }
        WireValue::Ref(r) => {
            let Json::Object(fields) = serde_json::to_value(r)? else {
                return Err(WireError::Malformed { what: "ref", details: "not an object".into() });
            };
            let mut map = Map::new();
            map.insert(TYPE_KEY.into(), Json::from("ref"));
            map.insert(SCHEMA_KEY.into(), Json::from(SCHEMA_VERSION));
            map.extend(fields);
            Json::Object(map)
        }
        WireValue::NeedsRef(hint) => {
            return Err(WireError::UnwrappedObject {
                module: hint.module.clone(),
                type_name: hint.type_name.clone(),
            });
        }
    };
    Ok(json)
}

fn special_to_json(s: SpecialFloat) -> Json {
    tagged("special_float", [("value", Json::from(s.as_tag()))])
}

// ============================================================================
//  WIRE DECODING
// ============================================================================

fn from_json_at(json: &Json, depth: usize) -> Result<WireValue> {
    if depth > MAX_DEPTH {
        return Err(WireError::RecursionLimitExceeded(MAX_DEPTH));
    }

    match json {
        Json::Null => Ok(WireValue::Null),
        Json::Bool(b) => Ok(WireValue::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(WireValue::Int(i))
            } else if n.is_u64() {
                Err(WireError::IntOutOfRange(n.to_string()))
            } else {
                n.as_f64()
                    .map(WireValue::Float)
                    .ok_or_else(|| WireError::Malformed { what: "number", details: n.to_string() })
            }
        }
        Json::String(s) => Ok(WireValue::Str(s.clone())),
        Json::Array(items) => Ok(WireValue::Seq(
            items.iter().map(|item| from_json_at(item, depth + 1)).collect::<Result<_>>()?,
        )),
        Json::Object(map) => from_object(map, depth),
    }
}

fn from_object(map: &Map<String, Json>, depth: usize) -> Result<WireValue> {
    if map.get("__needs_ref__") == Some(&Json::Bool(true)) {
        return Err(WireError::UnwrappedObject {
            module: str_field(map, "__module__").unwrap_or_default().to_string(),
            type_name: str_field(map, "__type_name__").unwrap_or_default().to_string(),
        });
    }

    let Some(tag) = str_field(map, TYPE_KEY) else {
        return plain_map(map, depth);
    };
    check_schema(map)?;

    match tag {
        "special_float" => match str_field(map, "value").and_then(SpecialFloat::from_tag) {
            Some(s) => Ok(WireValue::SpecialFloat(s)),
            None => plain_map(map, depth),
        },
        // Older workers tagged the special value directly.
        "nan" | "infinity" | "neg_infinity" => {
            Ok(WireValue::SpecialFloat(SpecialFloat::from_tag(tag).unwrap_or(SpecialFloat::Nan)))
        }
        "bytes" => {
            let data = str_field(map, "data")
                .or_else(|| str_field(map, "value"))
                .ok_or(WireError::MissingField("data"))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| WireError::Malformed { what: "bytes", details: e.to_string() })?;
            Ok(WireValue::Bytes(bytes))
        }
        "atom" => {
            let name = str_field(map, "value").ok_or(WireError::MissingField("value"))?;
            Ok(WireValue::Atom(name.to_string()))
        }
        "tuple" => {
            let elements = map
                .get("elements")
                .or_else(|| map.get("value"))
                .and_then(Json::as_array)
                .ok_or(WireError::MissingField("elements"))?;
            Ok(WireValue::Tuple(
                elements.iter().map(|item| from_json_at(item, depth + 1)).collect::<Result<_>>()?,
            ))
        }
        "ref" => {
            let wire_ref: WireRef = serde_json::from_value(Json::Object(map.clone()))
                .map_err(|e| WireError::Malformed { what: "ref", details: e.to_string() })?;
            Ok(WireValue::Ref(wire_ref))
        }
        // Unknown tags are kept whole rather than guessed at.
        _ => plain_map(map, depth),
    }
}

fn plain_map(map: &Map<String, Json>, depth: usize) -> Result<WireValue> {
    let mut entries = BTreeMap::new();
    for (k, v) in map {
        entries.insert(k.clone(), from_json_at(v, depth + 1)?);
    }
    Ok(WireValue::Map(entries))
}

fn check_schema(map: &Map<String, Json>) -> Result<()> {
    match map.get(SCHEMA_KEY).and_then(Json::as_u64) {
        Some(found) if found > SCHEMA_VERSION as u64 => {
            Err(WireError::SchemaUnsupported { found, supported: SCHEMA_VERSION })
        }
        _ => Ok(()),
    }
}

fn str_field<'a>(map: &'a Map<String, Json>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Json::as_str)
}

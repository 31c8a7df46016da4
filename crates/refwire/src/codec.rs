//! # Codec
//!
//! The translation layer between host `Value`s and `WireValue`s.
//!
//! ## Invariants
//! - **Round trip**: `decode(encode(v), s) == v` for every representable value.
//! - **Refs stay refs**: a ref-shaped payload always decodes to a `Ref` bound
//!   to the decoding session, never to a map or a string.
//! - **Bounded atoms**: atom tokens are resolved against the `AtomTable` only.

use crate::atoms::AtomTable;
use crate::error::Result;
use crate::error::WireError;
use crate::value::Ref;
use crate::value::SessionId;
use crate::value::Value;
use crate::value::SCHEMA_VERSION;
use crate::wire::SpecialFloat;
use crate::wire::WireRef;
use crate::wire::WireValue;
use crate::wire::MAX_DEPTH;

/// Stateless apart from its atom allow-list; cheap to share behind an `Arc`.
#[derive(Clone, Debug, Default)]
pub struct Codec {
    atoms: AtomTable,
}

impl Codec {
    pub fn new(atoms: AtomTable) -> Self {
        Self { atoms }
    }

    pub fn atoms(&self) -> &AtomTable {
        &self.atoms
    }

    /// Encodes a host value.
    ///
    /// Opaque host objects become `NeedsRef`; nothing is ever stringified.
    pub fn encode(&self, value: &Value) -> Result<WireValue> {
        encode_at(value, 0)
    }

    /// Decodes a wire value received on behalf of `session`.
    ///
    /// # Errors
    /// - `ForeignRef` if a ref names a different session.
    /// - `UnwrappedObject` if the peer leaked a `NeedsRef` signal.
    pub fn decode(&self, wire: &WireValue, session: &SessionId) -> Result<Value> {
        self.decode_at(wire, session, 0)
    }

    fn decode_at(&self, wire: &WireValue, session: &SessionId, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(WireError::RecursionLimitExceeded(MAX_DEPTH));
        }

        let value = match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Int(i) => Value::Int(*i),
            WireValue::Float(f) => Value::Float(*f),
            WireValue::SpecialFloat(s) => Value::Float(s.to_f64()),
            WireValue::Str(s) => Value::Str(s.clone()),
            WireValue::Bytes(b) => Value::Bytes(b.clone()),
            WireValue::Atom(name) => match self.atoms.resolve(name) {
                Some(atom) => Value::Atom(atom),
                None => Value::Str(name.clone()),
            },
            WireValue::Seq(items) => Value::List(
                items.iter().map(|item| self.decode_at(item, session, depth + 1)).collect::<Result<_>>()?,
            ),
            WireValue::Tuple(items) => Value::Tuple(
                items.iter().map(|item| self.decode_at(item, session, depth + 1)).collect::<Result<_>>()?,
            ),
            WireValue::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok::<_, WireError>((k.clone(), self.decode_at(v, session, depth + 1)?)))
                    .collect::<Result<_>>()?,
            ),
            WireValue::Ref(wire_ref) => Value::Ref(bind_ref(wire_ref, session)?),
            WireValue::NeedsRef(hint) => {
                return Err(WireError::UnwrappedObject {
                    module: hint.module.clone(),
                    type_name: hint.type_name.clone(),
                });
            }
        };
        Ok(value)
    }
}

fn encode_at(value: &Value, depth: usize) -> Result<WireValue> {
    if depth > MAX_DEPTH {
        return Err(WireError::RecursionLimitExceeded(MAX_DEPTH));
    }

    let wire = match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(i) => WireValue::Int(*i),
        Value::Float(f) => match SpecialFloat::classify(*f) {
            Some(special) => WireValue::SpecialFloat(special),
            None => WireValue::Float(*f),
        },
        Value::Str(s) => WireValue::Str(s.clone()),
        Value::Bytes(b) => WireValue::Bytes(b.clone()),
        Value::Atom(atom) => WireValue::Atom(atom.as_str().to_string()),
        Value::List(items) => WireValue::Seq(
            items.iter().map(|item| encode_at(item, depth + 1)).collect::<Result<_>>()?,
        ),
        Value::Tuple(items) => WireValue::Tuple(
            items.iter().map(|item| encode_at(item, depth + 1)).collect::<Result<_>>()?,
        ),
        Value::Map(entries) => WireValue::Map(
            entries
                .iter()
                .map(|(k, v)| Ok::<_, WireError>((k.clone(), encode_at(v, depth + 1)?)))
                .collect::<Result<_>>()?,
        ),
        Value::Ref(r) => WireValue::Ref(ref_to_wire(r)),
        Value::Opaque(hint) => WireValue::NeedsRef(hint.clone()),
    };
    Ok(wire)
}

/// The wire shape of a host ref.
pub fn ref_to_wire(r: &Ref) -> WireRef {
    WireRef {
        id: r.id.clone(),
        session_id: Some(r.session_id.clone()),
        module: r.remote_module.clone(),
        type_name: r.remote_type.clone(),
    }
}

fn bind_ref(wire_ref: &WireRef, session: &SessionId) -> Result<Ref> {
    match &wire_ref.session_id {
        Some(owner) if owner != session => Err(WireError::ForeignRef {
            ref_id: wire_ref.id.to_string(),
            owner: owner.to_string(),
            session: session.to_string(),
        }),
        _ => Ok(Ref {
            id: wire_ref.id.clone(),
            session_id: session.clone(),
            remote_module: wire_ref.module.clone(),
            remote_type: wire_ref.type_name.clone(),
            schema_version: SCHEMA_VERSION,
        }),
    }
}

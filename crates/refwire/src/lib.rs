//! # RefWire
//!
//! A versioned, self-describing wire format for calling into a foreign runtime
//! without ever flattening its objects into strings.
//!
//! ## Architecture
//!
//! Values move through three layers:
//!
//! 1. [`Value`]: what host code holds. Includes [`Ref`] handles and `Opaque`
//!    stand-ins for objects that have no wire shape.
//! 2. [`WireValue`]: the tagged, JSON-shaped tree. Special floats, bytes, atoms,
//!    tuples and refs are `{"__type__": ..., "__schema__": 1}` maps.
//! 3. JSON bytes, wrapped in a [`CallEnvelope`] or a [`Response`].
//!
//! ## Philosophy
//!
//! Every object either crosses as data or as a ref. There is no third path.
//! The [`Codec`] refuses unwrapped objects, refs bound to another session, and
//! schema or protocol versions it does not know, instead of guessing.

pub mod atoms;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod value;
pub mod wire;

#[cfg(test)]
mod tests;

pub use atoms::AtomTable;
pub use codec::ref_to_wire;
pub use codec::Codec;
pub use envelope::AttrOp;
pub use envelope::CallEnvelope;
pub use envelope::CallType;
pub use envelope::Outcome;
pub use envelope::RemoteErrorPayload;
pub use envelope::Response;
pub use envelope::Target;
pub use envelope::MIN_PROTOCOL_VERSION;
pub use envelope::PROTOCOL_VERSION;
pub use error::Result;
pub use error::WireError;
pub use value::Atom;
pub use value::Ref;
pub use value::RefId;
pub use value::SessionId;
pub use value::TypeHint;
pub use value::Value;
pub use value::SCHEMA_VERSION;
pub use wire::SpecialFloat;
pub use wire::WireRef;
pub use wire::WireValue;
pub use wire::MAX_DEPTH;

//! # Error Definitions
//!
//! Every way a value or frame can fail to cross the wire.

/// Codec and framing failures.
///
/// These are local, structural failures: the bytes (or the host value) could
/// not be represented faithfully. Remote execution failures travel inside a
/// successfully decoded `Response` instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    /// The payload was not valid JSON, or a typed field had the wrong JSON shape.
    #[error("invalid JSON payload: {0}")]
    Json(String),
    /// A value that needs a remote reference reached the serializer unwrapped.
    #[error("object of type {module}.{type_name} has no wire form and was not wrapped in a ref")]
    UnwrappedObject { module: String, type_name: String },
    /// A ref claims a session other than the one decoding it.
    #[error("ref {ref_id} belongs to session {owner}, not {session}")]
    ForeignRef { ref_id: String, owner: String, session: String },
    /// A tagged value carries a `__schema__` newer than this codec understands.
    #[error("schema version {found} is newer than the supported version {supported}")]
    SchemaUnsupported { found: u64, supported: u32 },
    /// The envelope speaks a protocol version outside the supported range.
    #[error("protocol version {found} is outside the supported range {min}..={max}")]
    ProtocolVersionUnsupported { found: u64, min: u32, max: u32 },
    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field is present but malformed.
    #[error("malformed {what}: {details}")]
    Malformed { what: &'static str, details: String },
    /// An integer outside the signed 64-bit range.
    #[error("integer {0} does not fit in 64 signed bits")]
    IntOutOfRange(String),
    /// The nested depth of a value exceeded the safety limit.
    #[error("value nesting exceeds the limit of {0}")]
    RecursionLimitExceeded(usize),
    /// An envelope named a call type this protocol does not define.
    #[error("unknown call type `{0}`")]
    UnknownCallType(String),
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

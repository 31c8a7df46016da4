//! # Error Translation
//!
//! Maps structured remote exceptions onto host error values.
//!
//! A handful of well-known failure kinds get dedicated variants. Everything
//! else gets a derived `ErrorKind` that is interned, so the same remote
//! exception class always surfaces as the same kind.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use refwire::RemoteErrorPayload;
use serde_json::Map;
use serde_json::Value as Json;

/// Identity given to remote exception classes past the cache bound.
const GENERIC_KIND: &str = "RemoteError";

/// An interned remote exception kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorKind(Arc<str>);

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if both kinds came from the same cache entry.
    pub fn ptr_eq(&self, other: &ErrorKind) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A translated remote exception.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFailure {
    Timeout { after_ms: Option<u64>, message: String },
    ShapeMismatch { expected: Option<String>, actual: Option<String>, message: String },
    OutOfMemory { requested_bytes: Option<u64>, device: Option<String>, message: String },
    ResourceExhausted { resource: Option<String>, message: String },
    Other {
        kind: ErrorKind,
        /// The kind exactly as the worker reported it.
        remote_kind: String,
        message: String,
        detail: Map<String, Json>,
    },
}

impl RemoteFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::Timeout { message, .. }
            | Self::ShapeMismatch { message, .. }
            | Self::OutOfMemory { message, .. }
            | Self::ResourceExhausted { message, .. }
            | Self::Other { message, .. } => message,
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { .. } => write!(f, "Timeout: {}", self.message()),
            Self::ShapeMismatch { .. } => write!(f, "ShapeMismatch: {}", self.message()),
            Self::OutOfMemory { .. } => write!(f, "OutOfMemory: {}", self.message()),
            Self::ResourceExhausted { .. } => write!(f, "ResourceExhausted: {}", self.message()),
            Self::Other { kind, message, .. } => write!(f, "{}: {}", kind, message),
        }
    }
}

enum WellKnown {
    Timeout,
    ShapeMismatch,
    OutOfMemory,
    ResourceExhausted,
}

pub struct ErrorTranslator {
    kinds: DashMap<String, ErrorKind>,
    max_kinds: usize,
    generic: ErrorKind,
    overflow_warned: AtomicBool,
}

impl ErrorTranslator {
    pub fn new(max_kinds: usize) -> Self {
        Self {
            kinds: DashMap::new(),
            max_kinds,
            generic: ErrorKind(Arc::from(GENERIC_KIND)),
            overflow_warned: AtomicBool::new(false),
        }
    }

    pub fn translate(&self, payload: &RemoteErrorPayload) -> RemoteFailure {
        let message = payload.message.clone();
        let detail = &payload.detail;

        match classify(&payload.kind) {
            Some(WellKnown::Timeout) => RemoteFailure::Timeout {
                after_ms: detail_u64(detail, &["after_ms", "timeout_ms"]),
                message,
            },
            Some(WellKnown::ShapeMismatch) => RemoteFailure::ShapeMismatch {
                expected: detail_text(detail, "expected"),
                actual: detail_text(detail, "actual"),
                message,
            },
            Some(WellKnown::OutOfMemory) => RemoteFailure::OutOfMemory {
                requested_bytes: detail_u64(detail, &["requested_bytes", "bytes"]),
                device: detail_text(detail, "device"),
                message,
            },
            Some(WellKnown::ResourceExhausted) => RemoteFailure::ResourceExhausted {
                resource: detail_text(detail, "resource"),
                message,
            },
            None => RemoteFailure::Other {
                kind: self.kind(&payload.kind),
                remote_kind: payload.kind.clone(),
                message,
                detail: detail.clone(),
            },
        }
    }

    /// Returns the interned kind for a remote exception class.
    pub fn kind(&self, remote_kind: &str) -> ErrorKind {
        let name = derive_name(remote_kind);
        if let Some(kind) = self.kinds.get(&name) {
            return kind.value().clone();
        }

        if self.kinds.len() >= self.max_kinds {
            if !self.overflow_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    limit = self.max_kinds,
                    remote_kind,
                    "derived error kind cache is full; new kinds map to {}",
                    GENERIC_KIND
                );
            }
            return self.generic.clone();
        }

        let interned = ErrorKind(Arc::from(name.as_str()));
        self.kinds.entry(name).or_insert(interned).value().clone()
    }

    pub fn cached_kinds(&self) -> usize {
        self.kinds.len()
    }
}

fn last_segment(kind: &str) -> &str {
    kind.rsplit(['.', ':']).find(|s| !s.is_empty()).unwrap_or(kind)
}

fn classify(kind: &str) -> Option<WellKnown> {
    let normalized: String = last_segment(kind)
        .chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    let stem = normalized.strip_suffix("error").unwrap_or(&normalized);

    match stem {
        "timeout" | "timedout" => Some(WellKnown::Timeout),
        "shapemismatch" | "shape" => Some(WellKnown::ShapeMismatch),
        "memory" | "outofmemory" | "oom" => Some(WellKnown::OutOfMemory),
        "resourceexhausted" => Some(WellKnown::ResourceExhausted),
        _ => None,
    }
}

/// `builtins.ValueError` -> `ValueError`, `torch:3rd-party` -> `_3rd_party`.
fn derive_name(kind: &str) -> String {
    let mut name: String = last_segment(kind)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        return GENERIC_KIND.to_string();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

fn detail_u64(detail: &Map<String, Json>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| detail.get(*k).and_then(Json::as_u64))
}

fn detail_text(detail: &Map<String, Json>, key: &str) -> Option<String> {
    detail.get(key).map(|v| match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    })
}

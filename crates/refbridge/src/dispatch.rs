//! # Dispatch Protocol
//!
//! Turns a declared signature plus a call site into a `CallEnvelope`, or
//! rejects the call locally before anything touches the wire.
//!
//! ## Invariants
//! - **Range Check**: `N` positional arguments are accepted iff
//!   `minimum_arity <= N` and `N <= maximum_arity` (or the maximum is unbounded).
//! - **Keywords First**: every required keyword-only parameter must be present.
//! - **Opaque Fallback**: a callable without an introspectable signature
//!   accepts `0..=variadic_ceiling` positional arguments and any keywords.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use refwire::AtomTable;
use refwire::CallEnvelope;
use refwire::SessionId;
use refwire::Target;
use refwire::WireValue;

/// Upper bound of a positional arity range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxArity {
    Bounded(usize),
    Unbounded,
}

impl fmt::Display for MaxArity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "={}", n),
            Self::Unbounded => Ok(()),
        }
    }
}

/// The positional and keyword shape of a remote callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArityInfo {
    pub minimum_arity: usize,
    pub maximum_arity: MaxArity,
    pub has_var_positional: bool,
    pub required_keyword_only: Vec<String>,
    pub optional_keyword_only: Vec<String>,
}

impl ArityInfo {
    /// Exactly `n` positional arguments.
    pub fn fixed(n: usize) -> Self {
        Self::range(n, n)
    }

    /// Between `min` and `max` positional arguments, e.g. trailing defaults.
    pub fn range(min: usize, max: usize) -> Self {
        Self {
            minimum_arity: min,
            maximum_arity: MaxArity::Bounded(max),
            has_var_positional: false,
            required_keyword_only: Vec::new(),
            optional_keyword_only: Vec::new(),
        }
    }

    /// At least `min` positional arguments, no upper bound.
    pub fn variadic(min: usize) -> Self {
        Self {
            minimum_arity: min,
            maximum_arity: MaxArity::Unbounded,
            has_var_positional: true,
            required_keyword_only: Vec::new(),
            optional_keyword_only: Vec::new(),
        }
    }

    pub fn required_keyword(mut self, name: impl Into<String>) -> Self {
        self.required_keyword_only.push(name.into());
        self
    }

    pub fn optional_keyword(mut self, name: impl Into<String>) -> Self {
        self.optional_keyword_only.push(name.into());
        self
    }

    pub fn accepts(&self, given: usize) -> bool {
        given >= self.minimum_arity
            && match self.maximum_arity {
                MaxArity::Bounded(max) => given <= max,
                MaxArity::Unbounded => true,
            }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Declared(ArityInfo),
    /// Declared, but the signature could not be introspected.
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArityError {
    #[error("{target} accepts {min}..{max} positional arguments, got {given}")]
    NotSupported { target: String, given: usize, min: usize, max: MaxArity },
    #[error("{target} requires keyword argument `{keyword}`")]
    MissingKeyword { target: String, keyword: String },
}

/// Everything about a call except its arguments.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub call_id: u64,
    pub session_id: SessionId,
    pub target: Target,
    pub idempotent: bool,
    pub protocol_version: u32,
}

/// Validates the call against `signature` and assembles the envelope.
///
/// `Dynamic` targets skip every arity check.
pub fn build_call(
    signature: &Signature,
    site: CallSite,
    args: Vec<WireValue>,
    kwargs: BTreeMap<String, WireValue>,
    variadic_ceiling: usize,
) -> Result<CallEnvelope, ArityError> {
    if !matches!(site.target, Target::Dynamic { .. }) {
        check_arity(signature, &site.target, args.len(), &kwargs, variadic_ceiling)?;
    }

    let mut envelope = CallEnvelope::new(site.call_id, site.session_id, site.target);
    envelope.args = args;
    envelope.kwargs = kwargs;
    envelope.idempotent = site.idempotent;
    envelope.protocol_version = site.protocol_version;
    Ok(envelope)
}

fn check_arity(
    signature: &Signature,
    target: &Target,
    given: usize,
    kwargs: &BTreeMap<String, WireValue>,
    variadic_ceiling: usize,
) -> Result<(), ArityError> {
    let info = match signature {
        Signature::Declared(info) => info,
        Signature::Opaque => {
            if given > variadic_ceiling {
                return Err(ArityError::NotSupported {
                    target: target.to_string(),
                    given,
                    min: 0,
                    max: MaxArity::Bounded(variadic_ceiling),
                });
            }
            return Ok(());
        }
    };

    if !info.accepts(given) {
        return Err(ArityError::NotSupported {
            target: target.to_string(),
            given,
            min: info.minimum_arity,
            max: info.maximum_arity,
        });
    }

    if let Some(missing) = info.required_keyword_only.iter().find(|k| !kwargs.contains_key(*k)) {
        return Err(ArityError::MissingKeyword {
            target: target.to_string(),
            keyword: missing.clone(),
        });
    }

    Ok(())
}

// ============================================================================
//  CATALOG
// ============================================================================

/// Declared surface of one remote class.
#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub constructor: Signature,
    pub methods: HashMap<String, Signature>,
}

impl ClassDecl {
    pub fn new(constructor: Signature) -> Self {
        Self { constructor, methods: HashMap::new() }
    }

    pub fn method(mut self, name: impl Into<String>, signature: Signature) -> Self {
        self.methods.insert(name.into(), signature);
        self
    }
}

/// The table of declared signatures a generated binding is built from.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    functions: HashMap<(String, String), Signature>,
    classes: HashMap<(String, String), ClassDecl>,
    module_attrs: HashMap<String, HashSet<String>>,
    atoms: BTreeSet<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, module: impl Into<String>, name: impl Into<String>, signature: Signature) -> Self {
        self.functions.insert((module.into(), name.into()), signature);
        self
    }

    pub fn class(mut self, module: impl Into<String>, class: impl Into<String>, decl: ClassDecl) -> Self {
        self.classes.insert((module.into(), class.into()), decl);
        self
    }

    pub fn module_attr(mut self, module: impl Into<String>, attr: impl Into<String>) -> Self {
        self.module_attrs.entry(module.into()).or_default().insert(attr.into());
        self
    }

    /// Declares an atom name that the codec may intern when decoding.
    pub fn atom(mut self, name: impl Into<String>) -> Self {
        self.atoms.insert(name.into());
        self
    }

    pub fn function_signature(&self, module: &str, name: &str) -> Option<&Signature> {
        self.functions.get(&(module.to_string(), name.to_string()))
    }

    pub fn class_decl(&self, module: &str, class: &str) -> Option<&ClassDecl> {
        self.classes.get(&(module.to_string(), class.to_string()))
    }

    /// Signature of `type_name.method`; opaque when the type or method is undeclared.
    pub fn method_signature(&self, module: &str, type_name: Option<&str>, method: &str) -> Signature {
        type_name
            .and_then(|ty| self.class_decl(module, ty))
            .and_then(|decl| decl.methods.get(method))
            .cloned()
            .unwrap_or(Signature::Opaque)
    }

    pub fn has_module_attr(&self, module: &str, attr: &str) -> bool {
        self.module_attrs.get(module).is_some_and(|attrs| attrs.contains(attr))
    }

    /// The codec allow-list: baseline atoms plus every declared one.
    pub fn atom_table(&self) -> AtomTable {
        AtomTable::with(&self.atoms)
    }
}

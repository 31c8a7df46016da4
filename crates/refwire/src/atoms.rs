//! # Atom Allow-List
//!
//! Atom-like tokens arriving from a worker are untrusted. They are only turned
//! into `Atom`s when the name was declared ahead of time; everything else stays
//! a plain string, so remote input can never grow the symbol table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Atom;

/// Names every table accepts.
const BASELINE: &[&str] = &["ok", "error", "nil"];

/// A bounded set of interned atom names.
#[derive(Clone, Debug)]
pub struct AtomTable {
    names: HashMap<Box<str>, Arc<str>>,
}

impl AtomTable {
    /// Creates a table holding only the baseline names.
    pub fn new() -> Self {
        let mut table = Self { names: HashMap::new() };
        for name in BASELINE {
            table.allow(name);
        }
        table
    }

    /// Creates a table with the baseline names plus `names`.
    pub fn with<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::new();
        for name in names {
            table.allow(name.as_ref());
        }
        table
    }

    /// Adds a name to the allow-list and returns its atom.
    pub fn allow(&mut self, name: &str) -> Atom {
        let interned = self
            .names
            .entry(name.into())
            .or_insert_with(|| Arc::from(name))
            .clone();
        Atom(interned)
    }

    /// Returns the atom for `name` if it is on the allow-list.
    pub fn resolve(&self, name: &str) -> Option<Atom> {
        self.names.get(name).map(|interned| Atom(interned.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

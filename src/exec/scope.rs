//! Lexical scopes for plan evaluation.

use std::collections::BTreeMap;

use crate::value::Value;

/// A chain of name bindings.
///
/// Each `let` node opens a child scope; lookups walk from the innermost
/// scope outwards, so inner bindings shadow outer ones without mutating
/// the parent.
#[derive(Debug)]
pub struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    bindings: BTreeMap<String, Value>,
}

impl<'a> Scope<'a> {
    /// The root scope, seeded with the caller's placeholder values.
    pub fn root(bindings: BTreeMap<String, Value>) -> Self {
        Scope {
            parent: None,
            bindings,
        }
    }

    /// An empty child scope chained onto `self`.
    pub fn child(&'a self) -> Scope<'a> {
        Scope {
            parent: Some(self),
            bindings: BTreeMap::new(),
        }
    }

    /// Adds or shadows a binding in this scope.
    pub fn bind(&mut self, name: String, value: Value) {
        self.bindings.insert(name, value);
    }

    /// Resolves a name, walking outwards through parent scopes.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        match self.bindings.get(name) {
            Some(value) => Some(value),
            None => self.parent.and_then(|p| p.lookup(name)),
        }
    }
}

//! Result-type unification.
//!
//! A command may expose several result facets. They must converge to one
//! concrete type: the single declared facet that is assignable to every
//! other declared facet. Names never declared in the catalog are opaque
//! leaf types (only equal names converge).

use std::collections::{BTreeSet, HashMap, HashSet};

/// Concrete result type of a shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultType {
    Void,
    Named(String),
}

impl ResultType {
    pub fn is_void(&self) -> bool {
        matches!(self, ResultType::Void)
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultType::Void => f.write_str("void"),
            ResultType::Named(name) => f.write_str(name),
        }
    }
}

/// Declared result types and their parents.
#[derive(Debug, Clone, Default)]
pub struct ResultTypeCatalog {
    parents: HashMap<String, Vec<String>>,
}

impl ResultTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: &str, parents: &[&str]) {
        let entry = self.parents.entry(name.to_string()).or_default();
        for parent in parents {
            if !entry.iter().any(|p| p == parent) {
                entry.push((*parent).to_string());
            }
        }
    }

    /// Reflexive, transitive "is a" check.
    pub fn is_assignable(&self, from: &str, to: &str) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(parents) = self.parents.get(current) {
                stack.extend(parents.iter().map(String::as_str));
            }
        }
        false
    }

    /// The single converging type, or `None` when the facets conflict.
    pub fn unify<S: AsRef<str>>(&self, facets: &[S]) -> Option<ResultType> {
        let distinct: BTreeSet<&str> = facets.iter().map(AsRef::as_ref).collect();
        if distinct.is_empty() {
            return Some(ResultType::Void);
        }
        let mut candidates = distinct
            .iter()
            .filter(|candidate| distinct.iter().all(|other| self.is_assignable(candidate, other)));
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Some(ResultType::Named((*only).to_string())),
            _ => None,
        }
    }
}

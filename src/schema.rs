//! Schema registry.
//!
//! Maps predicate names to ordered argument-type lists. The registry is
//! append-only: entries are never overwritten or removed. Both storage
//! backends embed a [`SchemaMap`] and share its validation rules.

use std::collections::HashMap;

use crate::error::TypeError;
use crate::fact::Fact;
use crate::value::ValueType;

/// Predicate names double as storage identifiers (SQL table names), so the
/// accepted alphabet is deliberately narrow: `[a-z0-9_]+`.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b == b'_' || b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The name was unknown and is now registered.
    Created,
    /// The name was known with an identical signature; no-op success.
    Identical,
    /// Invalid name, empty signature, or a conflicting existing signature.
    Rejected,
}

impl RegisterOutcome {
    /// Collapses to the wire-level `valid` bit.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Created | Self::Identical)
    }
}

/// In-memory registry of predicate signatures.
#[derive(Debug, Default, Clone)]
pub struct SchemaMap {
    entries: HashMap<String, Vec<ValueType>>,
}

impl SchemaMap {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to register `name` with `signature`.
    ///
    /// Re-registering an identical signature succeeds; a conflicting
    /// signature, an invalid name, or an empty signature is rejected.
    /// Rejection never disturbs the existing entry.
    pub fn register(&mut self, name: &str, signature: &[ValueType]) -> RegisterOutcome {
        if !valid_name(name) || signature.is_empty() {
            return RegisterOutcome::Rejected;
        }
        match self.entries.get(name) {
            Some(existing) if existing.as_slice() == signature => RegisterOutcome::Identical,
            Some(_) => RegisterOutcome::Rejected,
            None => {
                self.entries.insert(name.to_string(), signature.to_vec());
                RegisterOutcome::Created
            }
        }
    }

    /// Inserts a discovered entry without validation, used when a persistent
    /// backend reconstructs the registry from its own catalog at startup.
    pub fn insert_discovered(&mut self, name: String, signature: Vec<ValueType>) {
        self.entries.insert(name, signature);
    }

    /// Looks up a signature.
    #[must_use]
    pub fn signature(&self, name: &str) -> Option<&[ValueType]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Number of registered predicates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validates one fact against the registry.
    ///
    /// # Errors
    ///
    /// `UnknownPredicate`, `ArityMismatch`, or `ValueMismatch`; the first
    /// offending position wins.
    pub fn check_fact(&self, fact: &Fact) -> Result<(), TypeError> {
        let signature = self
            .entries
            .get(&fact.name)
            .ok_or_else(|| TypeError::UnknownPredicate {
                predicate: fact.name.clone(),
            })?;

        if signature.len() != fact.args.len() {
            return Err(TypeError::ArityMismatch {
                predicate: fact.name.clone(),
                expected: signature.len(),
                actual: fact.args.len(),
            });
        }

        for (position, (ty, value)) in signature.iter().zip(&fact.args).enumerate() {
            if !ty.check(value) {
                return Err(TypeError::ValueMismatch {
                    predicate: fact.name.clone(),
                    position,
                    expected: ty.clone(),
                    actual: value.kind_name(),
                });
            }
        }
        Ok(())
    }
}

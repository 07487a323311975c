//! The storage capability set.
//!
//! A backend is exactly three operations: schema registration, monotone
//! batch insert, and conjunctive query. Everything else (transactions,
//! pooling, locking) is internal to the implementation.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::StrataResult;
use crate::fact::{Context, Fact, FactTemplate};
use crate::value::ValueType;

/// Contract every fact-store backend must satisfy.
///
/// Implementations must keep the fact collection a *set* (re-inserting an
/// equal fact is a no-op) and must never remove or mutate a stored fact:
/// the store only grows, which is what makes fixpoint saturation terminate
/// when a full pass produces nothing new.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Registers `name` with `signature`.
    ///
    /// Returns `Ok(true)` for a new registration or an identical
    /// re-registration, `Ok(false)` for an invalid name, an empty
    /// signature, or a conflicting signature. `Err` is reserved for
    /// backend failures.
    async fn add_type(&self, name: &str, signature: &[ValueType]) -> StrataResult<bool>;

    /// Inserts a batch of facts.
    ///
    /// The whole batch is type-checked first; any ill-typed fact rejects
    /// everything with a `TypeError` and nothing is inserted. On success,
    /// returns the set of predicate names that gained at least one new
    /// fact (the *dirty-set*). Re-inserted duplicates contribute nothing.
    async fn set_facts(&self, facts: &[Fact]) -> StrataResult<BTreeSet<String>>;

    /// Evaluates `premises` as a conjunctive query under the shared
    /// variable scope.
    ///
    /// Returns the distinct satisfying contexts in ascending lexicographic
    /// order. A premise over an unknown predicate, with a mismatched
    /// arity, or with an `Exact` value whose tag disagrees with the schema
    /// yields zero matches rather than an error. An empty premise list
    /// yields one empty context.
    async fn get_facts(&self, premises: &[FactTemplate]) -> StrataResult<Vec<Context>>;
}

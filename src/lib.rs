//! # Strata: a forward-chaining fact engine
//!
//! Clients register typed fact predicates, publish ground facts, and attach
//! *analyzers*: remote procedures that consume tuples of facts matching a
//! conjunctive premise pattern and emit derived facts. The engine stores
//! facts, matches analyzer premises against the current fact set, dispatches
//! each distinct premise binding to its analyzer exactly once, ingests the
//! derived facts, and re-saturates until no analyzer produces anything new.
//!
//! ## Core concepts
//!
//! - **Fact**: a named, positionally typed tuple of [`Value`]s
//! - **Predicate**: a registered fact schema (name plus argument types)
//! - **Template**: a pattern over a predicate with exact, bound-variable,
//!   forall-variable, or wildcard positions
//! - **Context**: a variable-indexed assignment of values produced by a query
//! - **Analyzer**: a premise pattern plus a remote producer of derived facts
//! - **Dirty-set**: the predicates that gained at least one new fact in a
//!   saturation generation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata::{Fact, FactTemplate, MemoryStore, StrataEngine, TemplateArg, Value, ValueType};
//!
//! let engine = StrataEngine::new(Arc::new(MemoryStore::new()));
//!
//! engine.register_type("segment", &[ValueType::String, ValueType::Addr]).await?;
//! engine.set(&[Fact::new("segment", vec![Value::String("text".into()), Value::Addr(0x400000)])]).await?;
//!
//! let contexts = engine
//!     .derive(&[FactTemplate::new("segment", vec![TemplateArg::Bound(0), TemplateArg::Unbound])])
//!     .await?;
//! ```
//!
//! The store only grows: there is no retraction, which is what lets the
//! saturation loop stop as soon as a full pass adds nothing.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analyzer;
pub mod engine;
pub mod error;
pub mod fact;
pub mod schema;
pub mod storage;
pub mod value;

#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience.
pub use analyzer::{Analysis, Analyzer};
pub use engine::StrataEngine;
pub use error::{AnalysisError, StorageError, StrataError, StrataResult, TypeError};
pub use fact::{dependent_predicates, Context, Fact, FactTemplate, QueryScope, TemplateArg};
pub use schema::{valid_name, RegisterOutcome, SchemaMap};
#[cfg(feature = "backend-postgres")]
pub use storage::PgStore;
pub use storage::{FactStore, MemoryStore};
pub use value::{Value, ValueType};

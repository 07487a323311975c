//! Facts, templates, and query contexts.
//!
//! A [`Fact`] is a named, positionally typed tuple of values. A
//! [`FactTemplate`] is a pattern over one predicate; a sequence of templates
//! under a shared variable scope forms a conjunctive query. A [`Context`] is
//! the query result: values indexed by variable id.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};
use crate::value::Value;

/// A ground fact: predicate name plus argument tuple.
///
/// Facts order first by name, then element-wise by [`Value`] order; equality
/// is derived from that order. The fact store holds a set under this
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fact {
    /// Predicate name, `[a-z0-9_]+`.
    pub name: String,
    /// Argument values, positionally matching the registered signature.
    pub args: Vec<Value>,
}

impl Fact {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// One template position.
///
/// Variable ids are dense small integers scoped to a single query; the same
/// id may appear in several positions and premises, which is what expresses
/// a join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum TemplateArg {
    /// Matches iff the fact's value at this position equals the payload.
    Exact(Value),
    /// Scalar unification variable.
    Bound(usize),
    /// Aggregated variable: excluded from the grouping key, bound to the
    /// list of values it takes across the group.
    Forall(usize),
    /// Matches anything, exports nothing.
    Unbound,
}

impl TemplateArg {
    /// The variable id this position exports, if any.
    #[must_use]
    pub const fn var(&self) -> Option<usize> {
        match self {
            Self::Bound(v) | Self::Forall(v) => Some(*v),
            Self::Exact(_) | Self::Unbound => None,
        }
    }
}

/// A pattern over a single predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactTemplate {
    /// Predicate name this premise matches against.
    pub name: String,
    /// Template positions, one per predicate argument.
    pub args: Vec<TemplateArg>,
}

impl FactTemplate {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, args: Vec<TemplateArg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// A query result row: values indexed by variable id.
///
/// Every context produced by a K-variable query has length K. Contexts
/// compare lexicographically by [`Value`] order, which is the order query
/// results are returned in and the order the seen-binding caches use.
pub type Context = Vec<Value>;

/// The variable scope of one conjunctive query.
///
/// Computed once per query and shared by the match loop, the Forall
/// aggregation step, and the analyzer's dependent-set bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScope {
    /// Total number of variables; contexts have this length.
    pub var_count: usize,
    /// Ids marked `Forall` in at least one position.
    pub forall: BTreeSet<usize>,
}

impl QueryScope {
    /// Derives the scope of `premises`, validating that variable ids are
    /// dense: every id in `0..var_count` must be referenced somewhere.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` when an id in the range is never referenced (contexts
    /// are positional on the wire, so a hole would shift every later
    /// binding).
    pub fn of(premises: &[FactTemplate]) -> StrataResult<Self> {
        let mut seen = BTreeSet::new();
        let mut forall = BTreeSet::new();
        for premise in premises {
            for arg in &premise.args {
                if let Some(v) = arg.var() {
                    seen.insert(v);
                    if matches!(arg, TemplateArg::Forall(_)) {
                        forall.insert(v);
                    }
                }
            }
        }

        let var_count = seen.iter().next_back().map_or(0, |max| max + 1);
        for v in 0..var_count {
            if !seen.contains(&v) {
                return Err(StrataError::InvalidQuery {
                    reason: format!("variable ids must be dense: id {v} is never referenced"),
                });
            }
        }

        Ok(Self { var_count, forall })
    }
}

/// The union of predicate names referenced by `premises`.
///
/// This is an analyzer's *dependent set*: the predicates whose growth can
/// produce new premise bindings.
#[must_use]
pub fn dependent_predicates(premises: &[FactTemplate]) -> BTreeSet<String> {
    premises.iter().map(|p| p.name.clone()).collect()
}

//! In-memory storage backend.
//!
//! The reference implementation of [`FactStore`]: a schema map plus one
//! ordered fact set per predicate behind a single `RwLock`. Queries run a
//! nested-loop join over partial contexts; `Forall` variables are matched
//! as scalars and aggregated by grouping afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{StorageError, StrataError, StrataResult};
use crate::fact::{Context, Fact, FactTemplate, QueryScope, TemplateArg};
use crate::schema::SchemaMap;
use crate::storage::traits::FactStore;
use crate::value::{Value, ValueType};

fn lock_err(context: &'static str) -> StrataError {
    StorageError::Backend(format!("poisoned lock: {context}")).into()
}

#[derive(Debug, Default)]
struct MemoryState {
    schema: SchemaMap,
    facts: HashMap<String, BTreeSet<Vec<Value>>>,
}

/// Thread-safe in-memory fact store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored facts across all predicates. Test/diagnostic aid.
    pub fn fact_count(&self) -> StrataResult<usize> {
        let state = self.state.read().map_err(|_| lock_err("fact_count"))?;
        Ok(state.facts.values().map(BTreeSet::len).sum())
    }
}

/// Attempts to extend `row` so that `args` matches `fact_args`.
///
/// `Bound` and `Forall` positions both unify as scalars here; `Forall`
/// aggregation happens after the join. Returns the extended row, or `None`
/// if any position fails to match.
fn match_premise(
    args: &[TemplateArg],
    fact_args: &[Value],
    row: &[Option<Value>],
) -> Option<Vec<Option<Value>>> {
    let mut extended = row.to_vec();
    for (arg, fv) in args.iter().zip(fact_args) {
        match arg {
            TemplateArg::Exact(v) => {
                if v != fv {
                    return None;
                }
            }
            TemplateArg::Unbound => {}
            TemplateArg::Bound(k) | TemplateArg::Forall(k) => match &extended[*k] {
                Some(bound) => {
                    if bound != fv {
                        return None;
                    }
                }
                None => extended[*k] = Some(fv.clone()),
            },
        }
    }
    Some(extended)
}

/// True when some `Exact` position cannot possibly match the registered
/// type; such a premise yields zero matches without scanning.
fn exact_contradicts_schema(args: &[TemplateArg], signature: &[ValueType]) -> bool {
    args.iter()
        .zip(signature)
        .any(|(arg, ty)| matches!(arg, TemplateArg::Exact(v) if !ty.check(v)))
}

/// Groups fully-bound rows by their non-`Forall` slots and binds each
/// `Forall` slot to the ascending list of distinct values it takes across
/// the group.
fn aggregate_forall(rows: BTreeSet<Context>, scope: &QueryScope) -> BTreeSet<Context> {
    let scalar_slots: Vec<usize> = (0..scope.var_count)
        .filter(|k| !scope.forall.contains(k))
        .collect();

    let mut groups: BTreeMap<Vec<Value>, BTreeMap<usize, BTreeSet<Value>>> = BTreeMap::new();
    for row in rows {
        let key: Vec<Value> = scalar_slots.iter().map(|&k| row[k].clone()).collect();
        let entry = groups.entry(key).or_default();
        for &k in &scope.forall {
            entry.entry(k).or_default().insert(row[k].clone());
        }
    }

    let mut out = BTreeSet::new();
    for (key, aggregated) in groups {
        let mut ctx: Context = vec![Value::List(Vec::new()); scope.var_count];
        for (slot, value) in scalar_slots.iter().zip(key) {
            ctx[*slot] = value;
        }
        for (k, values) in aggregated {
            ctx[k] = Value::List(values.into_iter().collect());
        }
        out.insert(ctx);
    }
    out
}

#[async_trait]
impl FactStore for MemoryStore {
    async fn add_type(&self, name: &str, signature: &[ValueType]) -> StrataResult<bool> {
        let mut state = self.state.write().map_err(|_| lock_err("add_type"))?;
        Ok(state.schema.register(name, signature).is_valid())
    }

    async fn set_facts(&self, facts: &[Fact]) -> StrataResult<BTreeSet<String>> {
        let mut state = self.state.write().map_err(|_| lock_err("set_facts"))?;

        // Whole-batch validation up front: one bad fact rejects everything.
        for fact in facts {
            state.schema.check_fact(fact)?;
        }

        let mut changed = BTreeSet::new();
        for fact in facts {
            let inserted = state
                .facts
                .entry(fact.name.clone())
                .or_default()
                .insert(fact.args.clone());
            if inserted {
                changed.insert(fact.name.clone());
            }
        }
        Ok(changed)
    }

    async fn get_facts(&self, premises: &[FactTemplate]) -> StrataResult<Vec<Context>> {
        let scope = QueryScope::of(premises)?;
        let state = self.state.read().map_err(|_| lock_err("get_facts"))?;

        // Join premises left to right, carrying partially bound contexts.
        let mut rows: BTreeSet<Vec<Option<Value>>> = BTreeSet::new();
        rows.insert(vec![None; scope.var_count]);

        for premise in premises {
            let Some(signature) = state.schema.signature(&premise.name) else {
                return Ok(Vec::new());
            };
            if signature.len() != premise.args.len()
                || exact_contradicts_schema(&premise.args, signature)
            {
                return Ok(Vec::new());
            }
            let Some(facts) = state.facts.get(&premise.name) else {
                return Ok(Vec::new());
            };

            let mut next = BTreeSet::new();
            for row in &rows {
                for fact_args in facts {
                    if let Some(extended) = match_premise(&premise.args, fact_args, row) {
                        next.insert(extended);
                    }
                }
            }
            rows = next;
            if rows.is_empty() {
                return Ok(Vec::new());
            }
        }

        // Every variable id is referenced by some premise (scope is dense),
        // so surviving rows are fully bound.
        let mut full = BTreeSet::new();
        for row in rows {
            let ctx: Context = row
                .into_iter()
                .map(|slot| {
                    slot.ok_or_else(|| {
                        StrataError::internal("join left a variable unbound")
                    })
                })
                .collect::<StrataResult<_>>()?;
            full.insert(ctx);
        }

        let result = if scope.forall.is_empty() {
            full
        } else {
            aggregate_forall(full, &scope)
        };
        Ok(result.into_iter().collect())
    }
}

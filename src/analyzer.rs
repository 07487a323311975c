//! Analyzers: remote derived-fact producers.
//!
//! An analyzer pairs a conjunctive premise pattern with a remote
//! [`Analysis`] capability. Each distinct premise binding is dispatched to
//! the capability exactly once over the process lifetime; returned facts
//! are ingested back into the store as one batch.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::debug;

use crate::error::{AnalysisError, StorageError, StrataResult};
use crate::fact::{dependent_predicates, Context, Fact, FactTemplate};
use crate::storage::FactStore;

/// The remote capability an analyzer client exposes.
///
/// `context` is positional: `context[k]` is the value of variable `k` of
/// the analyzer's premises. The returned facts are derived knowledge to be
/// ingested into the store.
#[async_trait]
pub trait Analysis: Send + Sync {
    /// Runs the remote analysis for one premise binding.
    async fn analyze(&self, context: Context) -> Result<Vec<Fact>, AnalysisError>;
}

/// A registered analyzer.
///
/// Lives for the rest of the process once registered; holds the
/// seen-binding cache that enforces at-most-once dispatch.
pub struct Analyzer {
    name: String,
    premises: Vec<FactTemplate>,
    /// Predicates referenced by the premises; growth anywhere else cannot
    /// produce new bindings.
    dependent: BTreeSet<String>,
    analysis: Arc<dyn Analysis>,
    seen: Mutex<BTreeSet<Context>>,
}

impl Analyzer {
    /// Creates an analyzer over `premises` backed by `analysis`.
    pub fn new(
        name: impl Into<String>,
        premises: Vec<FactTemplate>,
        analysis: Arc<dyn Analysis>,
    ) -> Self {
        let dependent = dependent_predicates(&premises);
        Self {
            name: name.into(),
            premises,
            dependent,
            analysis,
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    /// The analyzer's name, as registered.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The premise pattern.
    #[must_use]
    pub fn premises(&self) -> &[FactTemplate] {
        &self.premises
    }

    /// Predicates whose growth can affect this analyzer.
    #[must_use]
    pub fn dependent(&self) -> &BTreeSet<String> {
        &self.dependent
    }

    /// Number of contexts dispatched so far. Test/diagnostic aid.
    pub fn seen_count(&self) -> StrataResult<usize> {
        let seen = self
            .seen
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: analyzer.seen".into()))?;
        Ok(seen.len())
    }

    /// Runs one generation of this analyzer against `store`.
    ///
    /// If `dirty` is non-empty and disjoint from the dependent set, the
    /// store is not consulted at all: no premise fact set can have grown,
    /// so any binding would either be cached already or still absent.
    /// Otherwise, enumerates current bindings, drops the ones already
    /// dispatched, sends the rest concurrently, ingests all derived facts
    /// as a single batch, and returns the resulting dirty-set.
    ///
    /// New contexts are marked seen *at dispatch time*, before the remote
    /// call resolves, so an overlapping generation cannot re-dispatch
    /// them. A remote failure propagates; facts from responses that never
    /// arrived are simply absent (nothing rolls back).
    pub async fn run(
        &self,
        store: &dyn FactStore,
        dirty: &BTreeSet<String>,
    ) -> StrataResult<BTreeSet<String>> {
        if !dirty.is_empty() && dirty.is_disjoint(&self.dependent) {
            return Ok(BTreeSet::new());
        }

        let contexts = store.get_facts(&self.premises).await?;

        // Membership test and optimistic insert under one lock acquisition.
        let fresh: Vec<Context> = {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| StorageError::Backend("poisoned lock: analyzer.seen".into()))?;
            contexts
                .into_iter()
                .filter(|ctx| seen.insert(ctx.clone()))
                .collect()
        };

        if fresh.is_empty() {
            return Ok(BTreeSet::new());
        }
        debug!(analyzer = %self.name, dispatched = fresh.len(), "dispatching new bindings");

        let responses = try_join_all(
            fresh
                .into_iter()
                .map(|ctx| self.analysis.analyze(ctx)),
        )
        .await?;

        let derived: Vec<Fact> = responses.into_iter().flatten().collect();
        if derived.is_empty() {
            return Ok(BTreeSet::new());
        }
        store.set_facts(&derived).await
    }
}

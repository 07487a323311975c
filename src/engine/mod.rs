//! Fixpoint driver.
//!
//! [`StrataEngine`] owns the fact store and the analyzer registry and runs
//! the saturation loop: insert, collect the dirty-set, run every analyzer
//! against it, union the produced dirty-sets, repeat until a full pass
//! produces nothing.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use futures::future::try_join_all;
use tracing::debug;

use crate::analyzer::{Analysis, Analyzer};
use crate::error::{StorageError, StrataResult};
use crate::fact::{Context, Fact, FactTemplate};
use crate::storage::FactStore;
use crate::value::ValueType;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// The engine: fact store plus analyzer registry plus saturation loop.
///
/// Process-wide by construction: wrap it in an `Arc` and share it between
/// transport handlers. Analyzers are appended, never removed; the registry
/// is not persisted across restarts.
pub struct StrataEngine {
    store: Arc<dyn FactStore>,
    analyzers: RwLock<Vec<Arc<Analyzer>>>,
}

impl StrataEngine {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn FactStore>) -> Self {
        Self {
            store,
            analyzers: RwLock::new(Vec::new()),
        }
    }

    /// The underlying fact store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn FactStore> {
        &self.store
    }

    /// Number of registered analyzers.
    pub fn analyzer_count(&self) -> StrataResult<usize> {
        let analyzers = self
            .analyzers
            .read()
            .map_err(|_| lock_err("analyzers.read"))?;
        Ok(analyzers.len())
    }

    /// Registers a predicate schema. See [`FactStore::add_type`].
    pub async fn register_type(&self, name: &str, signature: &[ValueType]) -> StrataResult<bool> {
        self.store.add_type(name, signature).await
    }

    /// Inserts `facts` and saturates.
    ///
    /// Returns only when the triggered fixpoint has quiesced. An ill-typed
    /// fact rejects the whole batch before anything runs; an analyzer
    /// failure aborts the fixpoint mid-flight (facts already ingested
    /// remain).
    pub async fn set(&self, facts: &[Fact]) -> StrataResult<()> {
        let dirty = self.store.set_facts(facts).await?;
        if !dirty.is_empty() {
            self.run_all(dirty).await?;
        }
        Ok(())
    }

    /// One-shot conjunctive query. Never triggers analyzer dispatch.
    pub async fn derive(&self, premises: &[FactTemplate]) -> StrataResult<Vec<Context>> {
        self.store.get_facts(premises).await
    }

    /// Registers an analyzer and immediately runs it once with an empty
    /// dirty-set so it catches up on every pre-existing fact, then
    /// saturates if that first pass produced anything.
    ///
    /// The engine call returns once quiesced; at the RPC layer the
    /// `analyzer` call stays pending forever, since an analyzer is a
    /// long-lived subscription.
    pub async fn add_analyzer(
        &self,
        name: impl Into<String>,
        premises: Vec<FactTemplate>,
        analysis: Arc<dyn Analysis>,
    ) -> StrataResult<()> {
        let analyzer = Arc::new(Analyzer::new(name, premises, analysis));
        {
            let mut analyzers = self
                .analyzers
                .write()
                .map_err(|_| lock_err("analyzers.write"))?;
            analyzers.push(Arc::clone(&analyzer));
        }
        debug!(analyzer = %analyzer.name(), "registered, running catch-up pass");

        let dirty = analyzer.run(self.store.as_ref(), &BTreeSet::new()).await?;
        if !dirty.is_empty() {
            self.run_all(dirty).await?;
        }
        Ok(())
    }

    /// The saturation loop.
    ///
    /// Each generation runs every analyzer concurrently against the current
    /// dirty-set and unions what they produce. The loop exits only when a
    /// full pass produces an empty union; divergent analyzer sets make it
    /// run forever, which is the specified behavior.
    async fn run_all(&self, mut dirty: BTreeSet<String>) -> StrataResult<()> {
        let mut generation = 0u64;
        while !dirty.is_empty() {
            let snapshot: Vec<Arc<Analyzer>> = {
                let analyzers = self
                    .analyzers
                    .read()
                    .map_err(|_| lock_err("analyzers.read"))?;
                analyzers.clone()
            };
            debug!(generation, dirty = ?dirty, analyzers = snapshot.len(), "saturation pass");

            let produced = try_join_all(
                snapshot
                    .iter()
                    .map(|analyzer| analyzer.run(self.store.as_ref(), &dirty)),
            )
            .await?;

            dirty = produced.into_iter().flatten().collect();
            generation += 1;
        }
        debug!(generations = generation, "quiesced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::AnalysisError;
    use crate::fact::TemplateArg;
    use crate::storage::MemoryStore;
    use crate::value::Value;

    /// Derives `to(x)` from each `from(?x)` binding, counting calls.
    struct Rename {
        to: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Analysis for Rename {
        async fn analyze(&self, context: Context) -> Result<Vec<Fact>, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Fact::new(self.to, vec![context[0].clone()])])
        }
    }

    fn bound0(name: &str) -> Vec<FactTemplate> {
        vec![FactTemplate::new(name, vec![TemplateArg::Bound(0)])]
    }

    async fn engine_with_types(names: &[&str]) -> StrataEngine {
        let store = Arc::new(MemoryStore::new());
        let engine = StrataEngine::new(store);
        for name in names {
            assert!(engine
                .register_type(name, &[ValueType::String])
                .await
                .unwrap());
        }
        engine
    }

    #[tokio::test]
    async fn set_saturates_through_one_analyzer() {
        let engine = engine_with_types(&["a", "b"]).await;
        let rename = Arc::new(Rename { to: "b", calls: AtomicUsize::new(0) });
        engine
            .add_analyzer("a_to_b", bound0("a"), rename.clone())
            .await
            .unwrap();

        engine
            .set(&[Fact::new("a", vec![Value::String("k".into())])])
            .await
            .unwrap();

        let ctxs = engine.derive(&bound0("b")).await.unwrap();
        assert_eq!(ctxs, vec![vec![Value::String("k".into())]]);
        assert_eq!(rename.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chained_analyzers_cascade_to_quiescence() {
        let engine = engine_with_types(&["a", "b", "c"]).await;
        engine
            .add_analyzer(
                "a_to_b",
                bound0("a"),
                Arc::new(Rename { to: "b", calls: AtomicUsize::new(0) }),
            )
            .await
            .unwrap();
        engine
            .add_analyzer(
                "b_to_c",
                bound0("b"),
                Arc::new(Rename { to: "c", calls: AtomicUsize::new(0) }),
            )
            .await
            .unwrap();

        engine
            .set(&[Fact::new("a", vec![Value::String("k".into())])])
            .await
            .unwrap();

        // a -> b in generation one, b -> c in generation two.
        let ctxs = engine.derive(&bound0("c")).await.unwrap();
        assert_eq!(ctxs, vec![vec![Value::String("k".into())]]);
    }

    #[tokio::test]
    async fn registration_catches_up_on_existing_facts() {
        let engine = engine_with_types(&["a", "b"]).await;
        engine
            .set(&[Fact::new("a", vec![Value::String("pre".into())])])
            .await
            .unwrap();

        let rename = Arc::new(Rename { to: "b", calls: AtomicUsize::new(0) });
        engine
            .add_analyzer("a_to_b", bound0("a"), rename.clone())
            .await
            .unwrap();

        // The pre-existing fact was picked up by the catch-up pass.
        let ctxs = engine.derive(&bound0("b")).await.unwrap();
        assert_eq!(ctxs, vec![vec![Value::String("pre".into())]]);
        assert_eq!(rename.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.analyzer_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn reinsert_does_not_redispatch() {
        let engine = engine_with_types(&["a", "b"]).await;
        let rename = Arc::new(Rename { to: "b", calls: AtomicUsize::new(0) });
        engine
            .add_analyzer("a_to_b", bound0("a"), rename.clone())
            .await
            .unwrap();

        let fact = Fact::new("a", vec![Value::String("k".into())]);
        engine.set(&[fact.clone()]).await.unwrap();
        engine.set(&[fact]).await.unwrap();

        assert_eq!(rename.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn derive_does_not_trigger_analyzers() {
        let engine = engine_with_types(&["a", "b"]).await;
        let rename = Arc::new(Rename { to: "b", calls: AtomicUsize::new(0) });
        engine
            .add_analyzer("a_to_b", bound0("a"), rename.clone())
            .await
            .unwrap();

        // Insert bypassing the engine, then derive: no dispatch happens.
        engine
            .store()
            .set_facts(&[Fact::new("a", vec![Value::String("k".into())])])
            .await
            .unwrap();
        let ctxs = engine.derive(&bound0("a")).await.unwrap();
        assert_eq!(ctxs.len(), 1);
        assert_eq!(rename.calls.load(Ordering::SeqCst), 0);
    }
}

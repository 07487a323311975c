//! End-to-end conjunctive query scenarios through the engine.

use std::sync::Arc;

use strata::{
    Fact, FactTemplate, MemoryStore, StrataEngine, StrataError, TemplateArg, Value, ValueType,
};

fn s(v: &str) -> Value {
    Value::String(v.into())
}

fn engine() -> StrataEngine {
    StrataEngine::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn single_premise_match() {
    let engine = engine();
    assert!(engine.register_type("p", &[ValueType::String]).await.unwrap());

    engine
        .set(&[Fact::new("p", vec![s("a")]), Fact::new("p", vec![s("b")])])
        .await
        .unwrap();

    let ctxs = engine
        .derive(&[FactTemplate::new("p", vec![TemplateArg::Bound(0)])])
        .await
        .unwrap();
    assert_eq!(ctxs, vec![vec![s("a")], vec![s("b")]]);
}

#[tokio::test]
async fn join_on_shared_variable() {
    let engine = engine();
    engine
        .register_type("p", &[ValueType::String, ValueType::String])
        .await
        .unwrap();
    engine
        .register_type("q", &[ValueType::String, ValueType::String])
        .await
        .unwrap();

    engine
        .set(&[
            Fact::new("p", vec![s("a"), s("b")]),
            Fact::new("p", vec![s("a"), s("c")]),
            Fact::new("q", vec![s("b"), s("z")]),
        ])
        .await
        .unwrap();

    let ctxs = engine
        .derive(&[
            FactTemplate::new("p", vec![TemplateArg::Bound(0), TemplateArg::Bound(1)]),
            FactTemplate::new("q", vec![TemplateArg::Bound(1), TemplateArg::Bound(2)]),
        ])
        .await
        .unwrap();
    assert_eq!(ctxs, vec![vec![s("a"), s("b"), s("z")]]);
}

#[tokio::test]
async fn forall_aggregation() {
    let engine = engine();
    engine
        .register_type("p", &[ValueType::String, ValueType::Addr])
        .await
        .unwrap();

    engine
        .set(&[
            Fact::new("p", vec![s("a"), Value::Addr(1)]),
            Fact::new("p", vec![s("a"), Value::Addr(2)]),
            Fact::new("p", vec![s("b"), Value::Addr(3)]),
        ])
        .await
        .unwrap();

    let ctxs = engine
        .derive(&[FactTemplate::new(
            "p",
            vec![TemplateArg::Bound(0), TemplateArg::Forall(1)],
        )])
        .await
        .unwrap();
    assert_eq!(
        ctxs,
        vec![
            vec![s("a"), Value::List(vec![Value::Addr(1), Value::Addr(2)])],
            vec![s("b"), Value::List(vec![Value::Addr(3)])],
        ]
    );
}

#[tokio::test]
async fn three_way_join_with_exact_anchor() {
    let engine = engine();
    engine
        .register_type("call", &[ValueType::Addr, ValueType::Addr])
        .await
        .unwrap();
    engine
        .register_type("func_name", &[ValueType::Addr, ValueType::String])
        .await
        .unwrap();

    engine
        .set(&[
            Fact::new("call", vec![Value::Addr(0x10), Value::Addr(0x20)]),
            Fact::new("call", vec![Value::Addr(0x10), Value::Addr(0x30)]),
            Fact::new("func_name", vec![Value::Addr(0x20), s("helper")]),
            Fact::new("func_name", vec![Value::Addr(0x30), s("main")]),
        ])
        .await
        .unwrap();

    // Callees of 0x10, with their names.
    let ctxs = engine
        .derive(&[
            FactTemplate::new(
                "call",
                vec![TemplateArg::Exact(Value::Addr(0x10)), TemplateArg::Bound(0)],
            ),
            FactTemplate::new("func_name", vec![TemplateArg::Bound(0), TemplateArg::Bound(1)]),
        ])
        .await
        .unwrap();
    assert_eq!(
        ctxs,
        vec![
            vec![Value::Addr(0x20), s("helper")],
            vec![Value::Addr(0x30), s("main")],
        ]
    );
}

#[tokio::test]
async fn unknown_predicate_is_zero_matches_not_error() {
    let engine = engine();
    let ctxs = engine
        .derive(&[FactTemplate::new("never_registered", vec![TemplateArg::Bound(0)])])
        .await
        .unwrap();
    assert!(ctxs.is_empty());
}

#[tokio::test]
async fn empty_query_yields_single_empty_context() {
    let engine = engine();
    let ctxs = engine.derive(&[]).await.unwrap();
    assert_eq!(ctxs, vec![Vec::<Value>::new()]);
}

#[tokio::test]
async fn sparse_variable_ids_are_rejected() {
    let engine = engine();
    engine.register_type("p", &[ValueType::Addr]).await.unwrap();

    let err = engine
        .derive(&[FactTemplate::new("p", vec![TemplateArg::Bound(1)])])
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::InvalidQuery { .. }));
}

#[tokio::test]
async fn ill_typed_batch_is_rejected_atomically() {
    let engine = engine();
    engine.register_type("p", &[ValueType::String]).await.unwrap();

    let err = engine
        .set(&[
            Fact::new("p", vec![s("fine")]),
            Fact::new("p", vec![Value::Blob(vec![1])]),
        ])
        .await
        .unwrap_err();
    assert!(err.is_type());

    // The well-typed half of the batch must not have been inserted.
    let ctxs = engine
        .derive(&[FactTemplate::new("p", vec![TemplateArg::Bound(0)])])
        .await
        .unwrap();
    assert!(ctxs.is_empty());
}

#[tokio::test]
async fn unregistered_fact_rejects_batch() {
    let engine = engine();
    let err = engine
        .set(&[Fact::new("ghost", vec![s("x")])])
        .await
        .unwrap_err();
    assert!(err.is_type());
}

#[tokio::test]
async fn type_registration_is_idempotent_but_conflicts_fail() {
    let engine = engine();
    let sig = [ValueType::String, ValueType::List(Box::new(ValueType::Addr))];

    assert!(engine.register_type("spans", &sig).await.unwrap());
    assert!(engine.register_type("spans", &sig).await.unwrap());
    assert!(!engine
        .register_type("spans", &[ValueType::String])
        .await
        .unwrap());
    assert!(!engine.register_type("Spans", &sig).await.unwrap());
}

#[tokio::test]
async fn list_values_round_trip_through_queries() {
    let engine = engine();
    engine
        .register_type(
            "trace",
            &[ValueType::String, ValueType::List(Box::new(ValueType::Addr))],
        )
        .await
        .unwrap();

    let path = Value::List(vec![Value::Addr(1), Value::Addr(2), Value::Addr(3)]);
    engine
        .set(&[Fact::new("trace", vec![s("t0"), path.clone()])])
        .await
        .unwrap();

    let ctxs = engine
        .derive(&[FactTemplate::new(
            "trace",
            vec![TemplateArg::Exact(s("t0")), TemplateArg::Bound(0)],
        )])
        .await
        .unwrap();
    assert_eq!(ctxs, vec![vec![path]]);
}

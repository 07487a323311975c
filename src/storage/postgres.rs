//! Postgres storage backend.
//!
//! Layout contract: one schema (`facts`) holding one table per registered
//! predicate, columns `arg0..argN-1`, with String→`varchar`, Addr→`bigint`
//! (the u64 bit pattern reinterpreted as i64 at this boundary), Blob→
//! `bytea`, Json→`jsonb`, and List<T>→array of the mapped T. Every table
//! carries a UNIQUE constraint over all columns; inserts go through
//! `ON CONFLICT DO NOTHING`, whose affected-row count doubles as the
//! dirty-set signal. Conjunctive queries compile to a single SELECT.
//!
//! At startup the registry is reconstructed from
//! `information_schema.columns`; a column this engine cannot map is a fatal
//! error.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, warn};

use crate::error::{StorageError, StrataError, StrataResult};
use crate::fact::{Context, Fact, FactTemplate, QueryScope, TemplateArg};
use crate::schema::{valid_name, SchemaMap};
use crate::storage::traits::FactStore;
use crate::value::{Value, ValueType};

fn backend_err(e: &tokio_postgres::Error) -> StrataError {
    StorageError::Backend(e.to_string()).into()
}

fn lock_err(context: &'static str) -> StrataError {
    StorageError::Backend(format!("poisoned lock: {context}")).into()
}

/// Maps a schema type to its column type, or fails for shapes Postgres
/// arrays cannot represent (nested lists, jsonb elements).
fn sql_column_type(ty: &ValueType) -> StrataResult<String> {
    Ok(match ty {
        ValueType::String => "varchar".to_string(),
        ValueType::Addr => "bigint".to_string(),
        ValueType::Blob => "bytea".to_string(),
        ValueType::Json => "jsonb".to_string(),
        ValueType::List(elem) => match elem.as_ref() {
            ValueType::String => "varchar[]".to_string(),
            ValueType::Addr => "bigint[]".to_string(),
            ValueType::Blob => "bytea[]".to_string(),
            other => {
                return Err(StorageError::Backend(format!(
                    "column type list<{other}> is not representable in the postgres layout"
                ))
                .into())
            }
        },
    })
}

/// Inverse of [`sql_column_type`] for startup discovery, keyed on
/// `information_schema.columns.udt_name` (arrays appear with a leading
/// underscore).
fn type_from_udt(udt_name: &str) -> Option<ValueType> {
    match udt_name {
        "varchar" => Some(ValueType::String),
        "int8" => Some(ValueType::Addr),
        "bytea" => Some(ValueType::Blob),
        "jsonb" => Some(ValueType::Json),
        "_varchar" => Some(ValueType::List(Box::new(ValueType::String))),
        "_int8" => Some(ValueType::List(Box::new(ValueType::Addr))),
        "_bytea" => Some(ValueType::List(Box::new(ValueType::Blob))),
        _ => None,
    }
}

/// An owned bind parameter. tokio-postgres borrows parameters at execution
/// time, so compiled queries carry these and lend out trait-object refs.
#[derive(Debug, Clone)]
enum PgParam {
    Text(String),
    Int(i64),
    Bytes(Vec<u8>),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    BytesArray(Vec<Vec<u8>>),
}

impl PgParam {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            Self::Text(v) => v,
            Self::Int(v) => v,
            Self::Bytes(v) => v,
            Self::TextArray(v) => v,
            Self::IntArray(v) => v,
            Self::BytesArray(v) => v,
        }
    }
}

/// Converts a value of a known column type into a bind parameter plus the
/// placeholder cast suffix it needs. Addr travels as the same 64 bits in a
/// signed column; Json travels as text and is cast server-side.
fn param_for(value: &Value, ty: &ValueType) -> StrataResult<(PgParam, &'static str)> {
    let unsupported = || -> StrataError {
        StorageError::Backend(format!(
            "value of type {ty} is not representable in the postgres layout"
        ))
        .into()
    };

    Ok(match (ty, value) {
        (ValueType::String, Value::String(s)) => (PgParam::Text(s.clone()), ""),
        #[allow(clippy::cast_possible_wrap)]
        (ValueType::Addr, Value::Addr(a)) => (PgParam::Int(*a as i64), ""),
        (ValueType::Blob, Value::Blob(b)) => (PgParam::Bytes(b.clone()), ""),
        (ValueType::Json, Value::Json(j)) => (PgParam::Text(j.clone()), "::text::jsonb"),
        (ValueType::List(elem), Value::List(vs)) => match elem.as_ref() {
            ValueType::String => {
                let mut out = Vec::with_capacity(vs.len());
                for v in vs {
                    match v {
                        Value::String(s) => out.push(s.clone()),
                        _ => return Err(unsupported()),
                    }
                }
                (PgParam::TextArray(out), "")
            }
            ValueType::Addr => {
                let mut out = Vec::with_capacity(vs.len());
                for v in vs {
                    match v {
                        #[allow(clippy::cast_possible_wrap)]
                        Value::Addr(a) => out.push(*a as i64),
                        _ => return Err(unsupported()),
                    }
                }
                (PgParam::IntArray(out), "")
            }
            ValueType::Blob => {
                let mut out = Vec::with_capacity(vs.len());
                for v in vs {
                    match v {
                        Value::Blob(b) => out.push(b.clone()),
                        _ => return Err(unsupported()),
                    }
                }
                (PgParam::BytesArray(out), "")
            }
            _ => return Err(unsupported()),
        },
        _ => return Err(unsupported()),
    })
}

/// Reads the row column at `idx`, produced by the select expression for a
/// column of type `ty`, back into a [`Value`].
fn value_from_row(row: &Row, idx: usize, ty: &ValueType) -> StrataResult<Value> {
    let get = |e: tokio_postgres::Error| -> StrataError {
        StorageError::Backend(format!("row decode failed at column {idx}: {e}")).into()
    };

    Ok(match ty {
        ValueType::String => Value::String(row.try_get::<_, String>(idx).map_err(get)?),
        #[allow(clippy::cast_sign_loss)]
        ValueType::Addr => Value::Addr(row.try_get::<_, i64>(idx).map_err(get)? as u64),
        ValueType::Blob => Value::Blob(row.try_get::<_, Vec<u8>>(idx).map_err(get)?),
        // Selected with `::text`.
        ValueType::Json => Value::Json(row.try_get::<_, String>(idx).map_err(get)?),
        ValueType::List(elem) => match elem.as_ref() {
            ValueType::String => Value::List(
                row.try_get::<_, Vec<String>>(idx)
                    .map_err(get)?
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
            #[allow(clippy::cast_sign_loss)]
            ValueType::Addr => Value::List(
                row.try_get::<_, Vec<i64>>(idx)
                    .map_err(get)?
                    .into_iter()
                    .map(|a| Value::Addr(a as u64))
                    .collect(),
            ),
            ValueType::Blob => Value::List(
                row.try_get::<_, Vec<Vec<u8>>>(idx)
                    .map_err(get)?
                    .into_iter()
                    .map(Value::Blob)
                    .collect(),
            ),
            other => {
                return Err(StorageError::Backend(format!(
                    "cannot decode list<{other}> column"
                ))
                .into())
            }
        },
    })
}

/// Decodes an `array_agg` select column over elements of type `elem`.
/// Returns `None` when the aggregate is NULL, which only happens for an
/// ungrouped aggregate over zero rows.
fn forall_from_row(row: &Row, idx: usize, elem: &ValueType) -> StrataResult<Option<Value>> {
    let get = |e: tokio_postgres::Error| -> StrataError {
        StorageError::Backend(format!("row decode failed at column {idx}: {e}")).into()
    };

    Ok(match elem {
        ValueType::String => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .map_err(get)?
            .map(|vs| Value::List(vs.into_iter().map(Value::String).collect())),
        #[allow(clippy::cast_sign_loss)]
        ValueType::Addr => row
            .try_get::<_, Option<Vec<i64>>>(idx)
            .map_err(get)?
            .map(|vs| Value::List(vs.into_iter().map(|a| Value::Addr(a as u64)).collect())),
        ValueType::Blob => row
            .try_get::<_, Option<Vec<Vec<u8>>>>(idx)
            .map_err(get)?
            .map(|vs| Value::List(vs.into_iter().map(Value::Blob).collect())),
        // Aggregated with `::text`.
        ValueType::Json => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .map_err(get)?
            .map(|vs| Value::List(vs.into_iter().map(Value::Json).collect())),
        ValueType::List(_) => {
            return Err(StorageError::Backend(
                "forall aggregation over a list<..> column is not supported by the postgres backend"
                    .to_string(),
            )
            .into())
        }
    })
}

/// One select-list entry: which variable it carries and how to decode it.
#[derive(Debug, Clone)]
enum SelectCol {
    /// Scalar variable of the given column type.
    Scalar(ValueType),
    /// `array_agg` over a column of the given element type; decodes to
    /// `Value::List`, absent (NULL) when the ungrouped query matched
    /// nothing.
    ForallAgg(ValueType),
}

/// A compiled conjunctive query: SQL text, owned parameters, and the
/// decode plan for the select list (indexed by variable id).
#[derive(Debug)]
struct CompiledQuery {
    sql: String,
    params: Vec<PgParam>,
    selects: Vec<SelectCol>,
}

/// Compiles `premises` into a single SELECT, or `None` when the query can
/// be answered as empty without touching the database (unknown predicate,
/// arity mismatch, Exact or shared-variable type contradictions).
fn compile_query(
    schema: &SchemaMap,
    premises: &[FactTemplate],
    scope: &QueryScope,
) -> StrataResult<Option<CompiledQuery>> {
    // Qualified column + type of each variable's defining occurrence.
    let mut var_col: Vec<Option<(String, ValueType)>> = vec![None; scope.var_count];
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<PgParam> = Vec::new();
    let mut from = String::new();

    for (i, premise) in premises.iter().enumerate() {
        let Some(signature) = schema.signature(&premise.name) else {
            return Ok(None);
        };
        if signature.len() != premise.args.len() {
            return Ok(None);
        }

        if i > 0 {
            from.push_str(", ");
        }
        let _ = write!(from, "facts.{} t{i}", premise.name);

        for (j, (arg, ty)) in premise.args.iter().zip(signature).enumerate() {
            let col = format!("t{i}.arg{j}");
            match arg {
                TemplateArg::Unbound => {}
                TemplateArg::Exact(v) => {
                    if !ty.check(v) {
                        return Ok(None);
                    }
                    let (param, cast) = param_for(v, ty)?;
                    params.push(param);
                    conditions.push(format!("{col} = ${}{cast}", params.len()));
                }
                TemplateArg::Bound(k) | TemplateArg::Forall(k) => match &var_col[*k] {
                    Some((first_col, first_ty)) => {
                        if first_ty != ty {
                            // Columns of different types can never be equal.
                            return Ok(None);
                        }
                        conditions.push(format!("{col} = {first_col}"));
                    }
                    None => var_col[*k] = Some((col, ty.clone())),
                },
            }
        }
    }

    // Select expression per variable; Json columns come back as text.
    let mut scalar_exprs: Vec<String> = Vec::new();
    let mut select_list: Vec<String> = Vec::new();
    let mut selects: Vec<SelectCol> = Vec::new();
    for (k, slot) in var_col.iter().enumerate() {
        let Some((col, ty)) = slot else {
            return Err(StrataError::internal("compiled query lost a variable"));
        };
        let scalar_expr = if matches!(ty, ValueType::Json) {
            format!("{col}::text")
        } else {
            col.clone()
        };
        if scope.forall.contains(&k) {
            if matches!(ty, ValueType::List(_)) {
                return Err(StorageError::Backend(
                    "forall aggregation over a list<..> column is not supported by the postgres backend"
                        .to_string(),
                )
                .into());
            }
            // Element order is normalized client-side under the Value total
            // order, so no ORDER BY inside the aggregate (server collation
            // need not agree with byte order).
            select_list.push(format!("array_agg(distinct {scalar_expr})"));
            selects.push(SelectCol::ForallAgg(ty.clone()));
        } else {
            scalar_exprs.push(scalar_expr.clone());
            select_list.push(scalar_expr);
            selects.push(SelectCol::Scalar(ty.clone()));
        }
    }

    let mut sql = String::from("select ");
    if select_list.is_empty() {
        // Ground query: existence check only.
        sql.push('1');
    } else if scope.forall.is_empty() {
        sql.push_str("distinct ");
        sql.push_str(&select_list.join(", "));
    } else {
        sql.push_str(&select_list.join(", "));
    }
    let _ = write!(sql, " from {from}");
    if !conditions.is_empty() {
        let _ = write!(sql, " where {}", conditions.join(" and "));
    }
    if !scope.forall.is_empty() && !scalar_exprs.is_empty() {
        let _ = write!(sql, " group by {}", scalar_exprs.join(", "));
    }

    Ok(Some(CompiledQuery {
        sql,
        params,
        selects,
    }))
}

/// Postgres-backed fact store.
///
/// Holds one connection; backend access is serialized through it. The
/// in-memory schema map mirrors the `facts` schema and is reconstructed on
/// connect.
pub struct PgStore {
    client: tokio::sync::Mutex<tokio_postgres::Client>,
    schema: RwLock<SchemaMap>,
}

impl PgStore {
    /// Connects, ensures the `facts` schema exists, and reconstructs the
    /// registry from the database catalog.
    ///
    /// # Errors
    ///
    /// `Connection` when the database is unreachable; `UnsupportedColumn`
    /// when an existing table carries a column type this engine cannot
    /// map (fatal by contract).
    pub async fn connect(conn_str: &str) -> StrataResult<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task ended");
            }
        });

        client
            .batch_execute("create schema if not exists facts")
            .await
            .map_err(|e| backend_err(&e))?;

        let rows = client
            .query(
                "select table_name, column_name, udt_name \
                 from information_schema.columns \
                 where table_schema = 'facts' \
                 order by table_name, ordinal_position",
                &[],
            )
            .await
            .map_err(|e| backend_err(&e))?;

        let mut schema = SchemaMap::new();
        let mut current: Option<(String, Vec<ValueType>)> = None;
        for row in &rows {
            let table: String = row.try_get(0).map_err(|e| backend_err(&e))?;
            let column: String = row.try_get(1).map_err(|e| backend_err(&e))?;
            let udt: String = row.try_get(2).map_err(|e| backend_err(&e))?;

            let Some(ty) = type_from_udt(&udt) else {
                return Err(StorageError::UnsupportedColumn {
                    table,
                    column,
                    sql_type: udt,
                }
                .into());
            };

            match &mut current {
                Some((name, sig)) if *name == table => sig.push(ty),
                _ => {
                    if let Some((name, sig)) = current.take() {
                        schema.insert_discovered(name, sig);
                    }
                    current = Some((table, vec![ty]));
                }
            }
        }
        if let Some((name, sig)) = current.take() {
            schema.insert_discovered(name, sig);
        }
        debug!(predicates = schema.len(), "reconstructed registry from catalog");

        Ok(Self {
            client: tokio::sync::Mutex::new(client),
            schema: RwLock::new(schema),
        })
    }

    fn schema_snapshot(&self) -> StrataResult<SchemaMap> {
        Ok(self
            .schema
            .read()
            .map_err(|_| lock_err("schema.read"))?
            .clone())
    }
}

#[async_trait]
impl FactStore for PgStore {
    async fn add_type(&self, name: &str, signature: &[ValueType]) -> StrataResult<bool> {
        if !valid_name(name) || signature.is_empty() {
            return Ok(false);
        }
        {
            let schema = self.schema.read().map_err(|_| lock_err("schema.read"))?;
            if let Some(existing) = schema.signature(name) {
                return Ok(existing == signature);
            }
        }

        let mut columns = Vec::with_capacity(signature.len());
        let mut unique = Vec::with_capacity(signature.len());
        for (i, ty) in signature.iter().enumerate() {
            columns.push(format!("arg{i} {}", sql_column_type(ty)?));
            unique.push(format!("arg{i}"));
        }
        // `name` is restricted to [a-z0-9_]+ above, so interpolation is safe.
        let ddl = format!(
            "create table if not exists facts.{name} ({}, unique ({}))",
            columns.join(", "),
            unique.join(", ")
        );

        let client = self.client.lock().await;
        client.batch_execute(&ddl).await.map_err(|e| backend_err(&e))?;
        drop(client);

        let mut schema = self.schema.write().map_err(|_| lock_err("schema.write"))?;
        Ok(schema.register(name, signature).is_valid())
    }

    async fn set_facts(&self, facts: &[Fact]) -> StrataResult<BTreeSet<String>> {
        let schema = self.schema_snapshot()?;
        // Whole-batch validation up front: one bad fact rejects everything.
        for fact in facts {
            schema.check_fact(fact)?;
        }

        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(|e| backend_err(&e))?;

        let mut changed = BTreeSet::new();
        for fact in facts {
            let signature = schema
                .signature(&fact.name)
                .ok_or_else(|| StrataError::internal("validated fact lost its signature"))?;

            let mut params = Vec::with_capacity(fact.args.len());
            let mut placeholders = Vec::with_capacity(fact.args.len());
            for (value, ty) in fact.args.iter().zip(signature) {
                let (param, cast) = param_for(value, ty)?;
                params.push(param);
                placeholders.push(format!("${}{cast}", params.len()));
            }

            let sql = format!(
                "insert into facts.{} values ({}) on conflict do nothing",
                fact.name,
                placeholders.join(", ")
            );
            let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(PgParam::as_sql).collect();
            let affected = tx.execute(&sql, &refs).await.map_err(|e| backend_err(&e))?;
            if affected > 0 {
                changed.insert(fact.name.clone());
            }
        }

        tx.commit().await.map_err(|e| backend_err(&e))?;
        Ok(changed)
    }

    async fn get_facts(&self, premises: &[FactTemplate]) -> StrataResult<Vec<Context>> {
        let scope = QueryScope::of(premises)?;
        if premises.is_empty() {
            return Ok(vec![Vec::new()]);
        }

        let schema = self.schema_snapshot()?;
        let Some(compiled) = compile_query(&schema, premises, &scope)? else {
            return Ok(Vec::new());
        };
        debug!(sql = %compiled.sql, "executing join query");

        let refs: Vec<&(dyn ToSql + Sync)> =
            compiled.params.iter().map(PgParam::as_sql).collect();
        let client = self.client.lock().await;
        let rows = client
            .query(&compiled.sql, &refs)
            .await
            .map_err(|e| backend_err(&e))?;
        drop(client);

        if compiled.selects.is_empty() {
            // Ground query: any row means the single empty context matches.
            return Ok(if rows.is_empty() {
                Vec::new()
            } else {
                vec![Vec::new()]
            });
        }

        let mut out: BTreeSet<Context> = BTreeSet::new();
        'rows: for row in &rows {
            let mut ctx = Vec::with_capacity(compiled.selects.len());
            for (idx, select) in compiled.selects.iter().enumerate() {
                match select {
                    SelectCol::Scalar(ty) => ctx.push(value_from_row(row, idx, ty)?),
                    SelectCol::ForallAgg(elem) => match forall_from_row(row, idx, elem)? {
                        Some(Value::List(mut vs)) => {
                            vs.sort();
                            ctx.push(Value::List(vs));
                        }
                        Some(other) => ctx.push(other),
                        // An ungrouped aggregate over zero rows yields one
                        // all-NULL row; that means no matches.
                        None => continue 'rows,
                    },
                }
            }
            out.insert(ctx);
        }
        Ok(out.into_iter().collect())
    }
}

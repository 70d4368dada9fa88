//! Direct Postgres backend. Rows travel as `jsonb` so the JSON-row contract
//! is the same as for the hosted backend.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info_span, Instrument};

use crate::{escape_like, DataSourceError, Direction, Predicate, Query, TabularDataSource};

#[derive(Debug, Clone)]
pub struct PgDataSource {
    pool: PgPool,
}

impl PgDataSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    async fn fetch_json_rows(
        &self,
        table: &str,
        mut builder: QueryBuilder<'static, Postgres>,
    ) -> Result<Vec<Value>, DataSourceError> {
        debug!(table, sql = builder.sql(), "postgres statement");
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .instrument(info_span!("postgres_query", table))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<Value, _>("row").map_err(DataSourceError::from))
            .collect()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ident(name: &str) -> Result<String, DataSourceError> {
    if is_identifier(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(DataSourceError::InvalidIdentifier(name.to_string()))
    }
}

fn push_where(
    builder: &mut QueryBuilder<'static, Postgres>,
    predicates: &[Predicate],
) -> Result<(), DataSourceError> {
    for (idx, predicate) in predicates.iter().enumerate() {
        builder.push(if idx == 0 { " WHERE " } else { " AND " });
        let column = format!("t.{}", ident(predicate.column())?);
        match predicate {
            Predicate::Eq { value, .. } => push_comparison(builder, &column, "=", value),
            Predicate::Gte { value, .. } => push_comparison(builder, &column, ">=", value),
            Predicate::Lte { value, .. } => push_comparison(builder, &column, "<=", value),
            Predicate::ILike { needle, .. } => {
                builder
                    .push(format!("{column} ILIKE '%' || "))
                    .push_bind(escape_like(needle))
                    .push(" || '%'");
            }
            Predicate::Contains { values, .. } => {
                builder
                    .push(format!("{column} @> "))
                    .push_bind(values.clone())
                    .push("::text[]");
            }
            Predicate::Overlaps { values, .. } => {
                builder
                    .push(format!("{column} && "))
                    .push_bind(values.clone())
                    .push("::text[]");
            }
            Predicate::NotNull { .. } => {
                builder.push(format!("{column} IS NOT NULL"));
            }
            Predicate::NotEmpty { .. } => {
                builder.push(format!("cardinality({column}) > 0"));
            }
        }
    }
    Ok(())
}

// Strings compare as text so uuid and enum columns accept them.
fn push_comparison(
    builder: &mut QueryBuilder<'static, Postgres>,
    column: &str,
    op: &str,
    value: &Value,
) {
    match value {
        Value::Bool(b) => {
            builder.push(format!("{column} {op} ")).push_bind(*b);
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                builder.push(format!("{column} {op} ")).push_bind(i);
            }
            None => {
                builder
                    .push(format!("{column} {op} "))
                    .push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            builder
                .push(format!("{column}::text {op} "))
                .push_bind(s.clone());
        }
        other => {
            builder
                .push(format!("{column} {op} "))
                .push_bind(sqlx::types::Json(other.clone()));
        }
    }
}

fn row_expression(query: &Query) -> Result<String, DataSourceError> {
    match query.column_list() {
        None => Ok("to_jsonb(t)".to_string()),
        Some(columns) => {
            let pairs = columns
                .iter()
                .map(|c| Ok(format!("'{c}', t.{}", ident(c)?)))
                .collect::<Result<Vec<_>, DataSourceError>>()?;
            Ok(format!("jsonb_build_object({})", pairs.join(", ")))
        }
    }
}

pub(crate) fn select_statement(query: &Query) -> Result<QueryBuilder<'static, Postgres>, DataSourceError> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} AS row FROM {} AS t",
        row_expression(query)?,
        ident(query.table_name())?
    ));
    push_where(&mut builder, query.predicates())?;
    for (idx, order) in query.ordering().iter().enumerate() {
        builder.push(if idx == 0 { " ORDER BY " } else { ", " });
        let direction = match order.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        let nulls = if order.nulls_last { "LAST" } else { "FIRST" };
        builder.push(format!(
            "t.{} {direction} NULLS {nulls}",
            ident(&order.column)?
        ));
    }
    if let Some(limit) = query.row_limit() {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }
    Ok(builder)
}

pub(crate) fn count_statement(query: &Query) -> Result<QueryBuilder<'static, Postgres>, DataSourceError> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT count(*) AS total FROM {} AS t",
        ident(query.table_name())?
    ));
    push_where(&mut builder, query.predicates())?;
    Ok(builder)
}

fn record_columns(table: &str, record: &Value) -> Result<Vec<String>, DataSourceError> {
    let Value::Object(fields) = record else {
        return Err(DataSourceError::Backend(format!(
            "write to {table} expects a JSON object"
        )));
    };
    fields.keys().map(|k| ident(k)).collect()
}

pub(crate) fn insert_statement(
    table: &str,
    record: Value,
) -> Result<QueryBuilder<'static, Postgres>, DataSourceError> {
    let table_ident = ident(table)?;
    let columns = record_columns(table, &record)?.join(", ");
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {table_ident} AS t ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table_ident}, "
    ));
    builder
        .push_bind(sqlx::types::Json(record))
        .push(") RETURNING to_jsonb(t) AS row");
    Ok(builder)
}

pub(crate) fn update_statement(
    query: &Query,
    patch: Value,
) -> Result<QueryBuilder<'static, Postgres>, DataSourceError> {
    let table_ident = ident(query.table_name())?;
    let columns = record_columns(query.table_name(), &patch)?;
    let sourced = columns
        .iter()
        .map(|c| format!("r.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut builder = QueryBuilder::new(format!(
        "UPDATE {table_ident} AS t SET ({}) = (SELECT {sourced} FROM jsonb_populate_record(NULL::{table_ident}, ",
        columns.join(", ")
    ));
    builder.push_bind(sqlx::types::Json(patch)).push(") AS r)");
    push_where(&mut builder, query.predicates())?;
    builder.push(" RETURNING to_jsonb(t) AS row");
    Ok(builder)
}

pub(crate) fn delete_statement(query: &Query) -> Result<QueryBuilder<'static, Postgres>, DataSourceError> {
    let mut builder = QueryBuilder::new(format!(
        "DELETE FROM {} AS t",
        ident(query.table_name())?
    ));
    push_where(&mut builder, query.predicates())?;
    builder.push(" RETURNING to_jsonb(t) AS row");
    Ok(builder)
}

#[async_trait]
impl TabularDataSource for PgDataSource {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>, DataSourceError> {
        let builder = select_statement(query)?;
        self.fetch_json_rows(query.table_name(), builder).await
    }

    async fn count(&self, query: &Query) -> Result<u64, DataSourceError> {
        let mut builder = count_statement(query)?;
        let row = builder
            .build()
            .fetch_one(&self.pool)
            .instrument(info_span!("postgres_query", table = query.table_name()))
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, DataSourceError> {
        let builder = insert_statement(table, record)?;
        self.fetch_json_rows(table, builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DataSourceError::Backend(format!("insert into {table} returned no row")))
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, DataSourceError> {
        let builder = update_statement(query, patch)?;
        self.fetch_json_rows(query.table_name(), builder).await
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Value>, DataSourceError> {
        let builder = delete_statement(query)?;
        self.fetch_json_rows(query.table_name(), builder).await
    }
}

//! In-process table store for local runs and tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{DataSourceError, Query, TabularDataSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Count,
    Insert,
    Update,
    Delete,
}

/// Tables of JSON rows behind a lock, evaluated with the same predicate
/// semantics as the remote backends.
#[derive(Debug, Default)]
pub struct MemoryDataSource {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashSet<(String, Operation)>>,
    issued: AtomicUsize,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>, rows: Vec<Value>) -> Self {
        self.tables.get_mut().insert(table.into(), rows);
        self
    }

    /// Seeds tables from a JSON object of the form `{ "table": [rows] }`.
    pub async fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let seed: HashMap<String, Vec<Value>> = serde_json::from_str(&data)
            .with_context(|| format!("parsing seed file {}", path.display()))?;
        Ok(Self {
            tables: RwLock::new(seed),
            ..Self::default()
        })
    }

    /// Makes every later `operation` on `table` fail with a backend error.
    pub async fn fail_on(&self, table: impl Into<String>, operation: Operation) {
        self.failures.lock().await.insert((table.into(), operation));
    }

    /// Number of operations attempted so far, failed ones included.
    pub fn issued_operations(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    async fn begin(&self, table: &str, operation: Operation) -> Result<(), DataSourceError> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .lock()
            .await
            .contains(&(table.to_string(), operation))
        {
            return Err(DataSourceError::Backend(format!(
                "{operation:?} on {table} rejected by memory backend"
            )));
        }
        Ok(())
    }
}

fn project(query: &Query, row: &Value) -> Value {
    let Some(columns) = query.column_list() else {
        return row.clone();
    };
    let mut out = Map::new();
    for column in columns {
        out.insert(
            column.to_string(),
            row.get(column).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(out)
}

#[async_trait]
impl TabularDataSource for MemoryDataSource {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>, DataSourceError> {
        self.begin(query.table_name(), Operation::Select).await?;
        let tables = self.tables.read().await;
        let mut rows = tables
            .get(query.table_name())
            .map(|rows| rows.iter().filter(|r| query.matches(r)).collect::<Vec<_>>())
            .unwrap_or_default();
        rows.sort_by(|a, b| query.compare_rows(a, b));
        let limit = query.row_limit().unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|row| project(query, row))
            .collect())
    }

    async fn count(&self, query: &Query) -> Result<u64, DataSourceError> {
        self.begin(query.table_name(), Operation::Count).await?;
        let tables = self.tables.read().await;
        let count = tables
            .get(query.table_name())
            .map(|rows| rows.iter().filter(|r| query.matches(r)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, DataSourceError> {
        self.begin(table, Operation::Insert).await?;
        let Value::Object(mut fields) = record else {
            return Err(DataSourceError::Backend(format!(
                "insert into {table} expects a JSON object"
            )));
        };
        fields
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        let row = Value::Object(fields);
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, DataSourceError> {
        self.begin(query.table_name(), Operation::Update).await?;
        let Value::Object(patch) = patch else {
            return Err(DataSourceError::Backend(format!(
                "update of {} expects a JSON object",
                query.table_name()
            )));
        };
        let mut tables = self.tables.write().await;
        let mut updated = Vec::new();
        if let Some(rows) = tables.get_mut(query.table_name()) {
            for row in rows.iter_mut().filter(|r| query.matches(r)) {
                if let Value::Object(fields) = row {
                    for (key, value) in &patch {
                        fields.insert(key.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Value>, DataSourceError> {
        self.begin(query.table_name(), Operation::Delete).await?;
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(query.table_name()) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<_>, Vec<_>) = rows.drain(..).partition(|r| query.matches(r));
        *rows = kept;
        Ok(removed)
    }
}

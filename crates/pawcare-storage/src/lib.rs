//! Tabular data-source capability and its backends for PawCare.
//!
//! Every backend speaks [`Query`] and hands rows back as JSON objects;
//! typed decoding happens in the callers via [`decode_rows`].

use async_trait::async_trait;
use pawcare_core::User;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

mod memory;
mod postgres;
mod postgrest;
mod query;

pub use memory::{MemoryDataSource, Operation};
pub use postgres::PgDataSource;
pub use postgrest::{HttpClientConfig, PostgrestDataSource, SupabaseAuth, SupabaseIdentity};
pub use query::{escape_like, Direction, Order, Predicate, Query};

pub const CRATE_NAME: &str = "pawcare-storage";

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {table}: {message}")]
    HttpStatus {
        status: u16,
        table: String,
        message: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decoding rows from {table}: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("{0}")]
    Backend(String),
}

/// Remote structured-table store with predicate, ordering and limit support.
#[async_trait]
pub trait TabularDataSource: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn select(&self, query: &Query) -> Result<Vec<Value>, DataSourceError>;

    /// Exact number of rows matching the query's predicates.
    async fn count(&self, query: &Query) -> Result<u64, DataSourceError>;

    /// Inserts one record and returns the stored row, defaults included.
    async fn insert(&self, table: &str, record: Value) -> Result<Value, DataSourceError>;

    /// Applies `patch` to every row matching the query's predicates.
    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, DataSourceError>;

    async fn delete(&self, query: &Query) -> Result<Vec<Value>, DataSourceError>;
}

/// Source of the acting account. `None` means no active session.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<User>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<User>,
}

impl StaticIdentity {
    pub fn anonymous() -> Self {
        Self { user: None }
    }

    pub fn signed_in(user: User) -> Self {
        Self { user: Some(user) }
    }
}

impl From<Option<User>> for StaticIdentity {
    fn from(user: Option<User>) -> Self {
        Self { user }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<User> {
        self.user.clone()
    }
}

pub fn decode_rows<T: DeserializeOwned>(
    table: &str,
    rows: Vec<Value>,
) -> Result<Vec<T>, DataSourceError> {
    rows.into_iter().map(|row| decode_row(table, row)).collect()
}

pub fn decode_row<T: DeserializeOwned>(table: &str, row: Value) -> Result<T, DataSourceError> {
    serde_json::from_value(row).map_err(|source| DataSourceError::Decode {
        table: table.to_string(),
        source,
    })
}

//! Search, stats and lost-pet services over a tabular data source.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pawcare_storage::{
    DataSourceError, HttpClientConfig, MemoryDataSource, PgDataSource, PostgrestDataSource,
    SupabaseAuth, TabularDataSource,
};
use thiserror::Error;
use tracing::{info, warn};

mod catalog;
mod filters;
mod lost;
mod stats;

pub use catalog::Catalog;
pub use filters::{build_pet_query, build_provider_query};
pub use lost::LostPetService;
pub use stats::{summarize_ratings, StatsAggregator};

pub const CRATE_NAME: &str = "pawcare-services";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("{operation}: {source}")]
    DataSource {
        operation: &'static str,
        #[source]
        source: DataSourceError,
    },
    #[error("{operation}: not permitted for the signed-in user")]
    Forbidden { operation: &'static str },
    #[error("{operation}: {id} not found")]
    NotFound { operation: &'static str, id: String },
    #[error("{operation}: {message}")]
    InvalidInput {
        operation: &'static str,
        message: String,
    },
    /// The report write landed but the pet's lost flag did not follow.
    #[error("{operation}: report {report_id} saved but lost flag on pet {pet_id} was not updated: {source}")]
    PartialWrite {
        operation: &'static str,
        report_id: String,
        pet_id: String,
        #[source]
        source: DataSourceError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgrest,
    Postgres,
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgrest" | "supabase" => Ok(Self::Postgrest),
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown backend {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PawcareConfig {
    pub backend: BackendKind,
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub database_url: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
}

impl PawcareConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backend = match lookup("PAWCARE_BACKEND") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                warn!("PAWCARE_BACKEND: {err}; falling back to memory");
                BackendKind::Memory
            }),
            None => BackendKind::Memory,
        };
        Self {
            backend,
            supabase_url: lookup("SUPABASE_URL"),
            supabase_anon_key: lookup("SUPABASE_ANON_KEY"),
            database_url: lookup("DATABASE_URL"),
            seed_file: lookup("PAWCARE_SEED_FILE").map(PathBuf::from),
            http_timeout_secs: lookup("PAWCARE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: lookup("PAWCARE_USER_AGENT").unwrap_or_else(|| "pawcare/0.1".to_string()),
            web_port: lookup("PAWCARE_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    /// Token verification is available whenever the hosted backend is configured.
    pub fn supabase_auth(&self) -> Result<Option<SupabaseAuth>> {
        match (&self.supabase_url, &self.supabase_anon_key) {
            (Some(url), Some(key)) => Ok(Some(SupabaseAuth::new(
                url.as_str(),
                key.as_str(),
                self.http_client_config(),
            )?)),
            _ => Ok(None),
        }
    }
}

/// Hosted backend client under the configured key; callers derive per-session
/// clients from it with [`PostgrestDataSource::with_access_token`].
pub fn postgrest_source(config: &PawcareConfig) -> Result<PostgrestDataSource> {
    let url = config
        .supabase_url
        .as_deref()
        .context("SUPABASE_URL is required for the postgrest backend")?;
    let key = config
        .supabase_anon_key
        .as_deref()
        .context("SUPABASE_ANON_KEY is required for the postgrest backend")?;
    PostgrestDataSource::new(url, key, config.http_client_config())
}

pub async fn connect_data_source(config: &PawcareConfig) -> Result<Arc<dyn TabularDataSource>> {
    let source: Arc<dyn TabularDataSource> = match config.backend {
        BackendKind::Postgrest => Arc::new(postgrest_source(config)?),
        BackendKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            Arc::new(PgDataSource::connect(url).await?)
        }
        BackendKind::Memory => match &config.seed_file {
            Some(path) => Arc::new(MemoryDataSource::from_json_file(path).await?),
            None => Arc::new(MemoryDataSource::new()),
        },
    };
    info!(backend = source.backend_name(), "data source ready");
    Ok(source)
}

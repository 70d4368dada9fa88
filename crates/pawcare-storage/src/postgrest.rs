//! Hosted backend access over its PostgREST and auth HTTP endpoints.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pawcare_core::User;
use reqwest::{header, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::{DataSourceError, IdentityProvider, Query, TabularDataSource};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Clone)]
pub struct PostgrestDataSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl PostgrestDataSource {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    /// Sends requests on behalf of a signed-in user instead of the anon key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn send_rows(
        &self,
        table: &str,
        builder: RequestBuilder,
    ) -> Result<Vec<Value>, DataSourceError> {
        let resp = builder.send().await?;
        let resp = check_status(table, resp).await?;
        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(rows)) => Ok(rows),
            Ok(other) => Ok(vec![other]),
            Err(source) => Err(DataSourceError::Decode {
                table: table.to_string(),
                source,
            }),
        }
    }
}

async fn check_status(
    table: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, DataSourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(DataSourceError::HttpStatus {
        status: status.as_u16(),
        table: table.to_string(),
        message: error_message(&text),
    })
}

// PostgREST error bodies carry `message`; anything else is passed through.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Total from a `Content-Range` header such as `0-24/312` or `*/0`.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl TabularDataSource for PostgrestDataSource {
    fn backend_name(&self) -> &'static str {
        "postgrest"
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>, DataSourceError> {
        let table = query.table_name();
        let params = query.postgrest_params();
        debug!(table, ?params, "postgrest select");
        let builder = self.request(Method::GET, table).query(&params);
        self.send_rows(table, builder)
            .instrument(info_span!("postgrest_request", table, method = "GET"))
            .await
    }

    async fn count(&self, query: &Query) -> Result<u64, DataSourceError> {
        let table = query.table_name();
        let mut params = vec![("select".to_string(), query.columns().to_string())];
        params.extend(query.postgrest_filter_params());
        let span = info_span!("postgrest_request", table, method = "HEAD");
        async {
            let resp = self
                .request(Method::HEAD, table)
                .header("Prefer", "count=exact")
                .query(&params)
                .send()
                .await?;
            let resp = check_status(table, resp).await?;
            resp.headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .ok_or_else(|| {
                    DataSourceError::Backend(format!("missing count for {table} in Content-Range"))
                })
        }
        .instrument(span)
        .await
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, DataSourceError> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&record);
        let rows = self
            .send_rows(table, builder)
            .instrument(info_span!("postgrest_request", table, method = "POST"))
            .await?;
        rows.into_iter().next().ok_or_else(|| {
            DataSourceError::Backend(format!("insert into {table} returned no row"))
        })
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, DataSourceError> {
        let table = query.table_name();
        let builder = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&query.postgrest_filter_params())
            .json(&patch);
        self.send_rows(table, builder)
            .instrument(info_span!("postgrest_request", table, method = "PATCH"))
            .await
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Value>, DataSourceError> {
        let table = query.table_name();
        let builder = self
            .request(Method::DELETE, table)
            .header("Prefer", "return=representation")
            .query(&query.postgrest_filter_params());
        self.send_rows(table, builder)
            .instrument(info_span!("postgrest_request", table, method = "DELETE"))
            .await
    }
}

/// Resolves session tokens against the hosted auth endpoint.
#[derive(Debug, Clone)]
pub struct SupabaseAuth {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SupabaseAuth {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// `Ok(None)` when the token is rejected.
    pub async fn user_for_token(&self, token: &str) -> Result<Option<User>, DataSourceError> {
        let resp = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .instrument(info_span!("auth_user_lookup"))
            .await?;
        if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Ok(None);
        }
        let resp = check_status("auth.users", resp).await?;
        Ok(Some(resp.json::<User>().await?))
    }
}

/// Identity bound to one bearer token.
#[derive(Debug, Clone)]
pub struct SupabaseIdentity {
    auth: SupabaseAuth,
    token: String,
}

impl SupabaseIdentity {
    pub fn new(auth: SupabaseAuth, token: impl Into<String>) -> Self {
        Self {
            auth,
            token: token.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentity {
    async fn current_user(&self) -> Option<User> {
        match self.auth.user_for_token(&self.token).await {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, "session lookup failed; treating caller as anonymous");
                None
            }
        }
    }
}

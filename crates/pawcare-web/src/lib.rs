//! Axum JSON API over the PawCare services.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pawcare_core::{
    choice_param, list_param, AdoptablePet, CareProvider, LostPetReport, LostReportPatch,
    NewLostReport, PetFilters, PriceRange, ProviderFilters, User, UserStatsSummary,
};
use pawcare_services::{
    connect_data_source, postgrest_source, BackendKind, Catalog, LostPetService, PawcareConfig,
    ServiceError, StatsAggregator,
};
use pawcare_storage::{
    IdentityProvider, PostgrestDataSource, StaticIdentity, SupabaseAuth, SupabaseIdentity,
    TabularDataSource,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pawcare-web";

/// Trusted caller id, honored only when no token verifier is configured.
pub const USER_HEADER: &str = "x-user-id";

const DEFAULT_REPORT_LIMIT: usize = 50;
const MAX_REPORT_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn TabularDataSource>,
    pub auth: Option<SupabaseAuth>,
    postgrest: Option<PostgrestDataSource>,
}

/// Data source and identity for one request.
struct Session {
    source: Arc<dyn TabularDataSource>,
    identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(source: Arc<dyn TabularDataSource>) -> Self {
        Self {
            source,
            auth: None,
            postgrest: None,
        }
    }

    /// Hosted backend. Signed-in requests query under the caller's own token
    /// so row-level policies apply to them.
    pub fn for_postgrest(source: PostgrestDataSource) -> Self {
        Self {
            source: Arc::new(source.clone()),
            auth: None,
            postgrest: Some(source),
        }
    }

    pub fn with_auth(mut self, auth: SupabaseAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    fn postgrest_for(&self, token: Option<&str>) -> Option<PostgrestDataSource> {
        Some(self.postgrest.clone()?.with_access_token(token?))
    }

    fn session(&self, headers: &HeaderMap) -> Session {
        match &self.auth {
            Some(auth) => {
                let token = bearer_token(headers);
                let source: Arc<dyn TabularDataSource> = match self.postgrest_for(token) {
                    Some(scoped) => Arc::new(scoped),
                    None => self.source.clone(),
                };
                let identity: Arc<dyn IdentityProvider> = match token {
                    Some(token) => Arc::new(SupabaseIdentity::new(auth.clone(), token)),
                    None => Arc::new(StaticIdentity::anonymous()),
                };
                Session { source, identity }
            }
            None => {
                let user = headers
                    .get(USER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(User::new);
                Session {
                    source: self.source.clone(),
                    identity: Arc::new(StaticIdentity::from(user)),
                }
            }
        }
    }

    fn lost_pets(&self, headers: &HeaderMap) -> LostPetService {
        let session = self.session(headers);
        LostPetService::new(session.source, session.identity)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Service(err) => match err {
                ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
                ServiceError::Forbidden { .. } => StatusCode::FORBIDDEN,
                ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
                ServiceError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
                ServiceError::DataSource { .. } => StatusCode::BAD_GATEWAY,
                ServiceError::PartialWrite { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProviderParams {
    location: Option<String>,
    pet_type: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    /// Comma separated.
    services: Option<String>,
    certified_only: Option<bool>,
}

impl ProviderParams {
    fn into_filters(self) -> Result<ProviderFilters, ApiError> {
        let price = match (self.min_price, self.max_price) {
            (None, None) => None,
            (Some(min), Some(max)) => {
                let range = PriceRange::new(min, max);
                if !range.is_valid() {
                    return Err(ApiError::BadRequest(
                        "min_price and max_price must be finite with min_price <= max_price"
                            .to_string(),
                    ));
                }
                Some(range)
            }
            _ => {
                return Err(ApiError::BadRequest(
                    "min_price and max_price must be given together".to_string(),
                ))
            }
        };
        Ok(ProviderFilters {
            location: choice_param(self.location.as_deref()),
            pet_type: choice_param(self.pet_type.as_deref()),
            price,
            services: list_param(self.services.as_deref()),
            certified_only: self.certified_only.unwrap_or(false),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct PetParams {
    location: Option<String>,
    pet_type: Option<String>,
    size: Option<String>,
    age: Option<String>,
}

impl From<PetParams> for PetFilters {
    fn from(params: PetParams) -> Self {
        Self {
            location: choice_param(params.location.as_deref()),
            pet_type: choice_param(params.pet_type.as_deref()),
            size: choice_param(params.size.as_deref()),
            age: choice_param(params.age.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CreateLostReport {
    pet_id: String,
    #[serde(flatten)]
    details: NewLostReport,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/providers", get(providers_handler))
        .route("/providers/{id}", get(provider_detail_handler))
        .route("/pets", get(pets_handler))
        .route("/pets/{id}", get(pet_detail_handler))
        .route("/stats", get(stats_handler))
        .route(
            "/lost-reports",
            get(lost_reports_handler).post(report_lost_handler),
        )
        .route(
            "/lost-reports/{id}",
            axum::routing::patch(update_report_handler).delete(delete_report_handler),
        )
        .route("/lost-reports/{id}/found", post(mark_found_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: PawcareConfig) -> anyhow::Result<()> {
    let mut state = match config.backend {
        BackendKind::Postgrest => AppState::for_postgrest(postgrest_source(&config)?),
        _ => AppState::new(connect_data_source(&config).await?),
    };
    if let Some(auth) = config.supabase_auth()? {
        state = state.with_auth(auth);
    }
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "pawcare api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(PawcareConfig::from_env()).await
}

async fn providers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProviderParams>,
) -> Result<Json<Vec<CareProvider>>, ApiError> {
    let filters = params.into_filters()?;
    let providers = Catalog::new(state.source.clone())
        .search_providers(&filters)
        .await?;
    Ok(Json(providers))
}

async fn provider_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CareProvider>, ApiError> {
    Catalog::new(state.source.clone())
        .provider(&id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ServiceError::NotFound {
                operation: "fetching care provider",
                id,
            }
            .into()
        })
}

async fn pets_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PetParams>,
) -> Result<Json<Vec<AdoptablePet>>, ApiError> {
    let pets = Catalog::new(state.source.clone())
        .search_pets(&params.into())
        .await?;
    Ok(Json(pets))
}

async fn pet_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AdoptablePet>, ApiError> {
    Catalog::new(state.source.clone())
        .pet(&id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ServiceError::NotFound {
                operation: "fetching pet",
                id,
            }
            .into()
        })
}

async fn stats_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<UserStatsSummary> {
    let session = state.session(&headers);
    let stats = StatsAggregator::new(session.source, session.identity)
        .compute_user_stats()
        .await;
    Json(stats)
}

async fn lost_reports_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<LostPetReport>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_REPORT_LIMIT)
        .clamp(1, MAX_REPORT_LIMIT);
    let reports = state.lost_pets(&headers).active_reports(limit).await?;
    Ok(Json(reports))
}

async fn report_lost_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateLostReport>,
) -> Result<(StatusCode, Json<LostPetReport>), ApiError> {
    let report = state
        .lost_pets(&headers)
        .report_lost(&body.pet_id, body.details)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn update_report_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<LostReportPatch>,
) -> Result<Json<LostPetReport>, ApiError> {
    let report = state.lost_pets(&headers).update_report(&id, patch).await?;
    Ok(Json(report))
}

async fn mark_found_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<LostPetReport>, ApiError> {
    let report = state.lost_pets(&headers).mark_found(&id).await?;
    Ok(Json(report))
}

async fn delete_report_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Resolve the caller once; the service re-reads the already resolved user.
    let session = state.session(&headers);
    let owner = session
        .identity
        .current_user()
        .await
        .ok_or(ServiceError::Unauthenticated)?;
    LostPetService::new(session.source, Arc::new(StaticIdentity::signed_in(owner.clone())))
        .delete_report(&id, &owner.id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use pawcare_core::tables;
    use pawcare_storage::MemoryDataSource;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn source() -> Arc<MemoryDataSource> {
        Arc::new(
            MemoryDataSource::new()
                .with_table(
                    tables::PROVIDERS,
                    vec![
                        json!({ "id": "h1", "category": "caregiver", "location": "Madrid", "price_per_night": 20.0,
                                "pet_types": ["Perro"], "services": ["paseo"], "certifications": null, "rating": 4.0 }),
                        json!({ "id": "h2", "category": "veterinary", "location": "Madrid", "price_per_night": 55.0,
                                "pet_types": ["Perro", "Gato"], "services": ["vacunas"], "certifications": ["COLVET"], "rating": null }),
                    ],
                )
                .with_table(
                    tables::PETS,
                    vec![
                        json!({ "id": "pet-1", "owner_id": "u1", "type": "Gato", "size": "Pequeño",
                                "category": "personal", "is_lost": false }),
                        json!({ "id": "pet-2", "type": "Perro", "size": "Grande", "urgent": true,
                                "category": "adoption" }),
                    ],
                )
                .with_table(
                    tables::BOOKINGS,
                    vec![json!({ "id": "b1", "user_id": "u1", "status": "completed", "rating": 5 })],
                ),
        )
    }

    fn test_app() -> (Arc<MemoryDataSource>, Router) {
        let source = source();
        (source.clone(), app(AppState::new(source)))
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn send_json(method: &str, uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn provider_search_treats_legacy_wildcard_as_absent() {
        let (_, app) = test_app();
        let (status, body) = call(&app, get("/providers?pet_type=Todos&min_price=20&max_price=55")).await;
        assert_eq!(status, StatusCode::OK);
        let ids = body
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn provider_search_filters_by_certification_and_services() {
        let (_, app) = test_app();
        let (status, body) = call(&app, get("/providers?certified_only=true&services=vacunas,paseo")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "h2");
    }

    #[tokio::test]
    async fn half_open_price_range_is_rejected() {
        let (_, app) = test_app();
        let (status, body) = call(&app, get("/providers?min_price=20")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("together"));
    }

    #[tokio::test]
    async fn non_finite_price_bound_is_rejected() {
        let (_, app) = test_app();
        let (status, _) = call(&app, get("/providers?min_price=NaN&max_price=55")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, get("/providers?min_price=60&max_price=55")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn signed_in_requests_use_the_callers_token() {
        let config = pawcare_storage::HttpClientConfig::default();
        let source = PostgrestDataSource::new("https://example.supabase.co", "anon", config.clone())
            .expect("client");
        let auth = SupabaseAuth::new("https://example.supabase.co", "anon", config).expect("auth");
        let state = AppState::for_postgrest(source).with_auth(auth);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer user-jwt".parse().unwrap());
        let scoped = state.postgrest_for(bearer_token(&headers)).expect("scoped source");
        assert_eq!(scoped.access_token(), Some("user-jwt"));
        assert!(state.postgrest_for(bearer_token(&HeaderMap::new())).is_none());
    }

    #[tokio::test]
    async fn pet_search_and_detail() {
        let (_, app) = test_app();
        let (status, body) = call(&app, get("/pets?pet_type=Perro&size=Todos")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "pet-2");

        let (status, _) = call(&app, get("/pets/pet-1")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, get("/providers/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_depend_on_the_caller() {
        let (_, app) = test_app();
        let (status, body) = call(&app, get("/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "completed_bookings": 0, "average_rating": null, "registered_pets": 0, "adoption_requests": 0 })
        );

        let request = Request::builder()
            .uri("/stats")
            .header(USER_HEADER, "u1")
            .body(Body::empty())
            .unwrap();
        let (_, body) = call(&app, request).await;
        assert_eq!(body["completed_bookings"], 1);
        assert_eq!(body["average_rating"], 5.0);
        assert_eq!(body["registered_pets"], 1);
    }

    #[tokio::test]
    async fn lost_report_lifecycle() {
        let (source, app) = test_app();

        let (status, _) = call(
            &app,
            send_json("POST", "/lost-reports", None, json!({ "pet_id": "pet-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, report) = call(
            &app,
            send_json(
                "POST",
                "/lost-reports",
                Some("u1"),
                json!({ "pet_id": "pet-1", "last_seen_location": "Lavapies" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let report_id = report["id"].as_str().unwrap().to_string();
        assert_eq!(source.rows(tables::PETS).await[0]["is_lost"], true);

        let (status, listed) = call(&app, get("/lost-reports")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, found) = call(
            &app,
            send_json("POST", &format!("/lost-reports/{report_id}/found"), Some("u1"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["status"], "found");
        assert_eq!(source.rows(tables::PETS).await[0]["is_lost"], false);

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/lost-reports/{report_id}"))
            .header(USER_HEADER, "u1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(source.rows(tables::LOST_PET_REPORTS).await.is_empty());
    }

    #[tokio::test]
    async fn empty_report_patch_is_a_bad_request() {
        let (_, app) = test_app();
        let (status, _) = call(
            &app,
            send_json("PATCH", "/lost-reports/nope", Some("u1"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

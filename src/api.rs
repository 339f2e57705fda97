use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::ingest::config::load_providers_default;
use crate::ingest::error::RunError;
use crate::ingest::provider_metrics::ProviderMetricSample;
use crate::ingest::registry::ProviderStatus;
use crate::ingest::types::{RunOutcome, RunRequest};
use crate::ingest::IngestionManager;
use crate::metrics::Metrics;
use crate::{reload_providers, ReloadReport};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<IngestionManager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/providers", get(list_providers))
        .route("/providers/metrics", get(provider_metrics))
        .route("/providers/reload", post(reload_config))
        .route("/providers/{id}/run", post(run_provider))
        .route("/providers/{id}/enable", post(enable_provider))
        .route("/providers/{id}/disable", post(disable_provider))
        .route("/providers/{id}/timings", get(symbol_timings))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Full app router, with `/metrics` when a Prometheus recorder is installed.
pub fn app_router(state: AppState, metrics: Option<&Metrics>) -> Router {
    let manager = state.manager.clone();
    let router = create_router(state);
    match metrics {
        Some(m) => router.merge(m.router(manager)),
        None => router,
    }
}

pub enum ApiError {
    Run(RunError),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        ApiError::Run(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::Run(e @ RunError::ProviderNotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Run(e @ RunError::ProviderDisabled { .. }) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

/// Empty body = defaults; anything else must be valid JSON.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderStatus>> {
    Json(state.manager.registry().list())
}

async fn provider_metrics(State(state): State<AppState>) -> Json<Vec<ProviderMetricSample>> {
    Json(state.manager.metrics().list())
}

/// Re-read the provider file and apply it to the live registry.
async fn reload_config(State(state): State<AppState>) -> Result<Json<ReloadReport>, ApiError> {
    let entries = load_providers_default().map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(reload_providers(state.manager.registry(), entries)))
}

#[derive(serde::Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RunBody {
    #[serde(default)]
    symbols: Option<Vec<String>>,
    #[serde(default)]
    rag: Option<bool>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    api_key: Option<String>,
}

async fn run_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<RunOutcome>, ApiError> {
    let b: RunBody = parse_body(&body)?;
    let req = RunRequest {
        provider_id: id,
        symbols: b.symbols,
        rag: b.rag,
        dry_run: b.dry_run,
        api_key: b.api_key,
        since: None,
    };
    let out = state.manager.run(req).await?;
    Ok(Json(out))
}

async fn enable_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProviderStatus>, ApiError> {
    let registry = state.manager.registry();
    registry.enable(&id);
    current_status(&state, &id)
}

#[derive(serde::Deserialize, Default)]
struct DisableBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn disable_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ProviderStatus>, ApiError> {
    let b: DisableBody = parse_body(&body)?;
    let reason = b.reason.unwrap_or_else(|| "disabled via admin api".to_string());
    state.manager.registry().disable(&id, reason);
    current_status(&state, &id)
}

async fn symbol_timings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BTreeMap<String, f64>>, ApiError> {
    if state.manager.registry().get(&id).is_none() {
        return Err(RunError::ProviderNotFound(id).into());
    }
    Ok(Json(state.manager.metrics().symbol_timings(&id)))
}

fn current_status(state: &AppState, id: &str) -> Result<Json<ProviderStatus>, ApiError> {
    state
        .manager
        .registry()
        .list()
        .into_iter()
        .find(|s| s.id == id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Provider not found: {id}")))
}

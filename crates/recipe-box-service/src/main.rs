use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use recipe_box_api::{
    ApiError, BrowseRequest, BrowseResult, CreateRecipeRequest, DeleteResult,
    FavoriteToggleResult, ForkRecipeRequest, GroupView, MigrateResult, RecipeBoxApi,
    RecipeRequest, ShowGroupRequest, UpdateRecipeRequest, API_CONTRACT_VERSION,
};
use recipe_box_core::{FavoriteSet, RecipeRecord, ViewerId};
use recipe_box_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: RecipeBoxApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct FavoritesListRequest {
    viewer_id: ViewerId,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "recipe-box-service")]
#[command(about = "Local HTTP service for Recipe Box")]
struct Args {
    #[arg(long, env = "RECIPE_BOX_DB", default_value = "./recipe_box.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "RECIPE_BOX_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Log filter directives; falls back to `RUST_LOG`, then `info`.
    #[arg(long, env = "RECIPE_BOX_LOG")]
    log: Option<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let (status, error_kind) = match err.downcast_ref::<ApiError>() {
            Some(ApiError::PermissionDenied { .. }) => (StatusCode::FORBIDDEN, "permission_denied"),
            Some(ApiError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Some(ApiError::InvalidInput(_)) => (StatusCode::BAD_REQUEST, "invalid_input"),
            None => (StatusCode::BAD_REQUEST, "request_failed"),
        };
        if error_kind == "request_failed" {
            warn!(error = %format!("{err:#}"), "request failed");
        }
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind,
            error: err.to_string(),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/recipes/create", post(recipes_create))
        .route("/v1/recipes/fork", post(recipes_fork))
        .route("/v1/recipes/update", post(recipes_update))
        .route("/v1/recipes/delete", post(recipes_delete))
        .route("/v1/favorites/toggle", post(favorites_toggle))
        .route("/v1/favorites/list", post(favorites_list))
        .route("/v1/browse", post(browse))
        .route("/v1/browse/group", post(browse_group))
        .with_state(state)
}

fn install_tracing(directives: Option<&str>) {
    let filter = directives.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        EnvFilter::new,
    );
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    install_tracing(args.log.as_deref());

    let state = ServiceState { api: RecipeBoxApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "recipe box service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    Ok(Json(envelope(state.api.migrate(request.dry_run)?)))
}

async fn db_integrity_check(State(state): State<ServiceState>) -> ServiceResult<IntegrityReport> {
    Ok(Json(envelope(state.api.integrity_check()?)))
}

async fn recipes_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateRecipeRequest>,
) -> ServiceResult<RecipeRecord> {
    Ok(Json(envelope(state.api.create_recipe(request)?)))
}

async fn recipes_fork(
    State(state): State<ServiceState>,
    Json(request): Json<ForkRecipeRequest>,
) -> ServiceResult<RecipeRecord> {
    Ok(Json(envelope(state.api.fork_recipe(request)?)))
}

async fn recipes_update(
    State(state): State<ServiceState>,
    Json(request): Json<UpdateRecipeRequest>,
) -> ServiceResult<RecipeRecord> {
    Ok(Json(envelope(state.api.update_recipe(request)?)))
}

async fn recipes_delete(
    State(state): State<ServiceState>,
    Json(request): Json<RecipeRequest>,
) -> ServiceResult<DeleteResult> {
    Ok(Json(envelope(state.api.delete_recipe(request)?)))
}

async fn favorites_toggle(
    State(state): State<ServiceState>,
    Json(request): Json<RecipeRequest>,
) -> ServiceResult<FavoriteToggleResult> {
    Ok(Json(envelope(state.api.toggle_favorite(request)?)))
}

async fn favorites_list(
    State(state): State<ServiceState>,
    Json(request): Json<FavoritesListRequest>,
) -> ServiceResult<FavoriteSet> {
    Ok(Json(envelope(state.api.list_favorites(&request.viewer_id)?)))
}

async fn browse(
    State(state): State<ServiceState>,
    Json(request): Json<BrowseRequest>,
) -> ServiceResult<BrowseResult> {
    Ok(Json(envelope(state.api.browse(request)?)))
}

async fn browse_group(
    State(state): State<ServiceState>,
    Json(request): Json<ShowGroupRequest>,
) -> ServiceResult<GroupView> {
    Ok(Json(envelope(state.api.show_group(request)?)))
}

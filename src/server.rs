//! JSON HTTP API.
//!
//! Thin handlers over [`VersionManager`], the build task store and the
//! monitoring reads. No orchestration happens here.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/versions` | Open a building version for a source |
//! | `GET`    | `/sources/{name}/versions` | List a source's versions, newest first |
//! | `GET`    | `/versions/{id}` | Fetch one version |
//! | `POST`   | `/versions/{id}/publish` | Make a building version active |
//! | `DELETE` | `/versions/{id}` | Delete an unreferenced version |
//! | `POST`   | `/versions/{id}/chunks` | Replace chunks of documents in a building version |
//! | `GET`    | `/stats` | Recording task counts (`?source_id=`) |
//! | `GET`    | `/tasks/search` | Keyword search over recording tasks (`?q=&source_id=&limit=`) |
//! | `POST`   | `/build-tasks` | Submit a new build task |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Envelope
//!
//! ```json
//! { "success": true, "data": { ... } }
//! { "success": false, "error": { "code": "VERSION_LOCKED", "message": "..." } }
//! ```
//!
//! Status codes: 400 for validation errors, 404 for missing versions and
//! sources, 409 for state conflicts, 500 otherwise.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::build_tasks;
use crate::config::Config;
use crate::db;
use crate::error::{parse_version_id, VersionError};
use crate::models::{ChunkUpload, NewBuildTask};
use crate::search::{self, DEFAULT_SEARCH_LIMIT};
use crate::stats;
use crate::versions::VersionManager;

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    versions: VersionManager,
}

/// Starts the API server on `[server].bind` and serves until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let app = router(pool);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "api server listening");
    println!("API server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table, with CORS open to every origin.
pub fn router(pool: SqlitePool) -> Router {
    let state = AppState {
        versions: VersionManager::new(pool.clone()),
        pool,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/versions", post(handle_create_version))
        .route("/sources/{name}/versions", get(handle_list_versions))
        .route(
            "/versions/{id}",
            get(handle_get_version).delete(handle_delete_version),
        )
        .route("/versions/{id}/publish", post(handle_publish))
        .route("/versions/{id}/chunks", post(handle_upload_chunks))
        .route("/stats", get(handle_stats))
        .route("/tasks/search", get(handle_search))
        .route("/build-tasks", post(handle_submit_build_task))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Envelope ============

#[derive(Serialize)]
struct SuccessBody<T> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

fn ok<T: Serialize>(data: T) -> Json<SuccessBody<T>> {
    Json(SuccessBody {
        success: true,
        data,
    })
}

fn created<T: Serialize>(data: T) -> (StatusCode, Json<SuccessBody<T>>) {
    (StatusCode::CREATED, ok(data))
}

/// Wraps [`VersionError`] so handlers can return it directly.
struct ApiError(VersionError);

impl From<VersionError> for ApiError {
    fn from(err: VersionError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(VersionError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(VersionError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!(code = self.0.code(), "request failed: {}", self.0);
        }
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.0.code(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============ Versions ============

#[derive(Deserialize)]
struct CreateVersionRequest {
    source_name: String,
    #[serde(default)]
    commit_message: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
}

async fn handle_create_version(
    State(state): State<AppState>,
    body: Result<Json<CreateVersionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let version = state
        .versions
        .create_version(
            &req.source_name,
            req.commit_message.as_deref(),
            req.created_by.as_deref(),
        )
        .await?;
    Ok(created(version))
}

async fn handle_list_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let versions = state.versions.list_versions(&name).await?;
    Ok(ok(versions))
}

async fn handle_get_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let version_id = parse_version_id(&id)?;
    let version = state.versions.get_version(version_id).await?;
    Ok(ok(version))
}

async fn handle_publish(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let version_id = parse_version_id(&id)?;
    let outcome = state.versions.publish(version_id).await?;
    Ok(ok(outcome))
}

async fn handle_delete_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let version_id = parse_version_id(&id)?;
    let summary = state.versions.delete_version(version_id).await?;
    Ok(ok(summary))
}

#[derive(Deserialize)]
struct UploadChunksRequest {
    chunks: Vec<ChunkUpload>,
}

async fn handle_upload_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<UploadChunksRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let version_id = parse_version_id(&id)?;
    let Json(req) = body?;
    let summary = state.versions.upload_chunks(version_id, &req.chunks).await?;
    Ok(ok(summary))
}

// ============ Monitoring ============

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    source_id: Option<i64>,
}

async fn handle_stats(
    State(state): State<AppState>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = query?;
    let stats = stats::task_stats(&state.pool, params.source_id).await?;
    Ok(ok(stats))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default)]
    source_id: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_search(
    State(state): State<AppState>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = query?;
    let hits = search::search_tasks(
        &state.pool,
        &params.q,
        params.source_id,
        params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
    )
    .await?;
    Ok(ok(hits))
}

// ============ Build tasks ============

#[derive(Serialize)]
struct SubmittedTask {
    id: i64,
}

async fn handle_submit_build_task(
    State(state): State<AppState>,
    body: Result<Json<NewBuildTask>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(task) = body?;
    if task.source_url.trim().is_empty() {
        return Err(VersionError::InvalidRequest("source_url must not be empty".to_string()).into());
    }
    let id = build_tasks::submit_build_task(&state.pool, &task).await?;
    Ok(created(SubmittedTask { id }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> impl IntoResponse {
    ok(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

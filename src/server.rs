use crate::config::{Config, APP_NAME};
use crate::core::{BoardProfile, DeviceDescriptor, FlashRequest, ProjectRef, DEFAULT_MAIN_FILE};
use crate::jobs::{AdmissionError, Attempt, AttemptKind, AttemptManager};
use crate::SketchRunner;
use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Finished attempts are forgotten after an hour.
const ATTEMPT_RETENTION_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
struct CompileParams {
    project_id: Option<Uuid>,
    project_path: Option<PathBuf>,
    name: Option<String>,
    main_file_name: Option<String>,
    fqbn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlashParams {
    image: PathBuf,
    fqbn: Option<String>,
    device: DeviceDescriptor,
    #[serde(default = "default_true")]
    verify: bool,
    #[serde(default)]
    erase: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ApiResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ToolchainResponse {
    installed: bool,
    arch: String,
    binary: PathBuf,
    default_board: String,
}

type ApiError = (StatusCode, Json<ApiResponse>);

#[derive(Clone)]
struct AppState {
    runner: SketchRunner,
    attempts: AttemptManager,
}

fn reject(status: StatusCode, error: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(ApiResponse {
            status: "error".to_string(),
            attempt_id: None,
            error: Some(error.to_string()),
        }),
    )
}

fn conflict(error: AdmissionError) -> ApiError {
    warn!("Rejected attempt: {}", error);
    reject(StatusCode::CONFLICT, error)
}

fn accepted(id: Uuid) -> (StatusCode, Json<ApiResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse {
            status: "accepted".to_string(),
            attempt_id: Some(id),
            error: None,
        }),
    )
}

fn validate_image(image: &std::path::Path) -> Result<()> {
    if image.as_os_str().is_empty() {
        return Err(anyhow!("image must name a firmware file"));
    }
    if image.is_relative() {
        return Err(anyhow!("image must be an absolute path"));
    }
    Ok(())
}

fn resolve_project(
    runner: &SketchRunner,
    params: &CompileParams,
    board: &BoardProfile,
) -> Result<ProjectRef> {
    if let Some(id) = params.project_id {
        return runner
            .catalog()
            .get_project(&id)
            .ok_or_else(|| anyhow!("Project not found: {}", id));
    }

    let path = params
        .project_path
        .clone()
        .ok_or_else(|| anyhow!("project_id or project_path is required"))?;
    if path.is_relative() {
        return Err(anyhow!("project_path must be an absolute path"));
    }

    let name = params
        .name
        .clone()
        .or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .ok_or_else(|| anyhow!("Cannot derive a project name from {}", path.display()))?;

    let mut project = ProjectRef::new(name, path, board.fqbn.clone());
    project.main_file_name = params
        .main_file_name
        .clone()
        .unwrap_or_else(|| DEFAULT_MAIN_FILE.to_string());
    Ok(project)
}

async fn compile_handler(
    State(state): State<Arc<AppState>>,
    Json(params): Json<CompileParams>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    let board = state
        .runner
        .resolve_board(params.fqbn.as_deref())
        .map_err(|e| reject(StatusCode::NOT_FOUND, e))?;
    let project = resolve_project(&state.runner, &params, &board)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("invalid request: {}", e)))?;

    state.attempts.cleanup_completed(ATTEMPT_RETENTION_SECS);
    let id = state
        .attempts
        .reserve(AttemptKind::Compile, project.name.clone(), None)
        .map_err(conflict)?;

    info!("Compile request {}: {} for {}", id, project.name, board.fqbn);
    state.attempts.track(id, state.runner.compile(project, board));
    Ok(accepted(id))
}

async fn flash_handler(
    State(state): State<Arc<AppState>>,
    Json(params): Json<FlashParams>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    validate_image(&params.image)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("invalid request: {}", e)))?;
    let board = state
        .runner
        .resolve_board(params.fqbn.as_deref())
        .map_err(|e| reject(StatusCode::NOT_FOUND, e))?;

    let mut request = FlashRequest::new(params.image, board, params.device);
    request.verify_after_flash = params.verify;
    request.erase_before_flash = params.erase;

    state.attempts.cleanup_completed(ATTEMPT_RETENTION_SECS);
    let id = state
        .attempts
        .reserve(
            AttemptKind::Flash,
            request.device.display_name(),
            Some(request.device.exclusivity_key()),
        )
        .map_err(conflict)?;

    info!(
        "Flash request {}: {} -> {}",
        id,
        request.image.display(),
        request.device.display_name()
    );
    state.attempts.track(id, state.runner.flash(request));
    Ok(accepted(id))
}

async fn install_handler(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    state.attempts.cleanup_completed(ATTEMPT_RETENTION_SECS);
    let id = state
        .attempts
        .reserve(AttemptKind::Install, "toolchain", None)
        .map_err(conflict)?;

    info!("Toolchain install request {}", id);
    state.attempts.track(id, state.runner.install_toolchain());
    Ok(accepted(id))
}

async fn toolchain_handler(State(state): State<Arc<AppState>>) -> Json<ToolchainResponse> {
    let installer = state.runner.installer();
    Json(ToolchainResponse {
        installed: installer.is_installed().await,
        arch: installer.arch().as_str().to_string(),
        binary: installer.binary_path(),
        default_board: state.runner.preferences().default_board(),
    })
}

async fn boards_handler(State(state): State<Arc<AppState>>) -> Json<Vec<BoardProfile>> {
    Json(state.runner.catalog().list_boards())
}

async fn match_handler(
    State(state): State<Arc<AppState>>,
    Json(device): Json<DeviceDescriptor>,
) -> Json<Vec<BoardProfile>> {
    Json(state.runner.candidate_boards(&device))
}

async fn attempts_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Attempt>> {
    let mut attempts = state.attempts.list();
    attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(attempts)
}

async fn attempt_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Attempt>, ApiError> {
    state
        .attempts
        .get(&id)
        .map(Json)
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, format!("attempt {} not found", id)))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    if state.attempts.cancel(&id) {
        Ok((
            StatusCode::ACCEPTED,
            Json(ApiResponse {
                status: "cancelling".to_string(),
                attempt_id: Some(id),
                error: None,
            }),
        ))
    } else {
        Err(reject(
            StatusCode::NOT_FOUND,
            format!("no running attempt {}", id),
        ))
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": APP_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub fn create_app(runner: SketchRunner) -> Router {
    let state = Arc::new(AppState {
        runner,
        attempts: AttemptManager::new(),
    });

    Router::new()
        .route("/health", get(health_handler))
        .route("/boards", get(boards_handler))
        .route("/boards/match", post(match_handler))
        .route("/toolchain", get(toolchain_handler))
        .route("/toolchain/install", post(install_handler))
        .route("/compile", post(compile_handler))
        .route("/flash", post(flash_handler))
        .route("/attempts", get(attempts_handler))
        .route("/attempts/:id", get(attempt_handler).delete(cancel_handler))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let port = config.port;
    let app = create_app(SketchRunner::new(config));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

//! Minimal admin API consumed by the CLI and the web frontend.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use habitat_core::operations::{
    AddUserOperation, AddUserOperationRequest, InstallAppOperation, InstallAppOperationRequest,
    StartProcessOperation, StartProcessOperationRequest, StopProcessOperation,
    StopProcessOperationRequest, UninstallAppOperation, UninstallAppOperationRequest,
    UpgradeAppOperation, UpgradeAppOperationRequest,
};
use habitat_core::{ErrorKind, HabitatError, NodeController, Package, ReverseProxyRule};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct AdminState {
    pub controller: NodeController,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/node", get(get_node))
        .route("/node/users", post(add_user))
        .route("/node/processes", post(start_process))
        .route("/node/processes/:process_id", delete(stop_process))
        .route("/node/apps", post(install_app))
        .route("/node/apps/:app_id", delete(uninstall_app))
        .route("/node/apps/:app_id/upgrade", post(upgrade_app))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<F>(
    addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown: F,
) -> habitat_core::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Admin API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Error body shared by every admin endpoint: `{"error": "<message>"}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput | ErrorKind::SchemaViolation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists | ErrorKind::Conflict | ErrorKind::PreconditionFailed => {
            StatusCode::CONFLICT
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ExternalDriver => StatusCode::BAD_GATEWAY,
        ErrorKind::LogIo | ErrorKind::Serialization | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<HabitatError> for ApiError {
    fn from(error: HabitatError) -> Self {
        Self {
            status: status_for(error.kind()),
            message: error.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Admin request failed: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

async fn health_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let node_id = state
        .controller
        .node_state()
        .await
        .map(|node| node.node_id)
        .unwrap_or_default();
    (StatusCode::OK, Json(json!({ "status": "ok", "node_id": node_id })))
}

async fn get_node(State(state): State<Arc<AdminState>>) -> ApiResult {
    let node = state.controller.node_state().await?;
    Ok((StatusCode::OK, Json(node)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AddUserBody {
    pub username: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub atproto_did: Option<String>,
}

async fn add_user(
    State(state): State<Arc<AdminState>>,
    body: Result<Json<AddUserBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    if body.username.trim().is_empty() {
        return Err(ApiError::bad_request("username must not be empty"));
    }
    let result = AddUserOperation::new(state.controller.clone())
        .run(AddUserOperationRequest {
            username: body.username,
            certificate: body.certificate,
            atproto_did: body.atproto_did,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "user": result.user }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct StartProcessBody {
    pub app_id: String,
}

async fn start_process(
    State(state): State<Arc<AdminState>>,
    body: Result<Json<StartProcessBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let result = StartProcessOperation::new(state.controller.clone())
        .run(StartProcessOperationRequest {
            app_id: body.app_id,
            wait_until_running: false,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "process_id": result.process_id })),
    )
        .into_response())
}

async fn stop_process(
    State(state): State<Arc<AdminState>>,
    Path(process_id): Path<String>,
) -> ApiResult {
    StopProcessOperation::new(state.controller.clone())
        .run(StopProcessOperationRequest {
            process_id: process_id.clone(),
            wait_until_stopped: true,
        })
        .await?;
    Ok((StatusCode::OK, Json(json!({ "process_id": process_id }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct InstallAppBody {
    pub user_id: String,
    pub name: String,
    pub version: String,
    pub package: Package,
    #[serde(default)]
    pub proxy_rules: Vec<ReverseProxyRule>,
}

async fn install_app(
    State(state): State<Arc<AdminState>>,
    body: Result<Json<InstallAppBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let result = InstallAppOperation::new(state.controller.clone())
        .run(InstallAppOperationRequest {
            user_id: body.user_id,
            name: body.name,
            version: body.version,
            package: body.package,
            proxy_rules: body.proxy_rules,
            wait_until_installed: false,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "app_id": result.app_id, "state": result.state })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpgradeAppBody {
    pub version: String,
    pub package: Package,
    #[serde(default)]
    pub proxy_rules: Vec<ReverseProxyRule>,
}

async fn upgrade_app(
    State(state): State<Arc<AdminState>>,
    Path(app_id): Path<String>,
    body: Result<Json<UpgradeAppBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let result = UpgradeAppOperation::new(state.controller.clone())
        .run(UpgradeAppOperationRequest {
            app_id,
            version: body.version,
            package: body.package,
            proxy_rules: body.proxy_rules,
        })
        .await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "previously_running": result.previously_running,
            "stopped_process_id": result.stopped_process_id,
            "new_process_id": result.new_process_id,
        })),
    )
        .into_response())
}

async fn uninstall_app(
    State(state): State<Arc<AdminState>>,
    Path(app_id): Path<String>,
) -> ApiResult {
    let result = UninstallAppOperation::new(state.controller.clone())
        .run(UninstallAppOperationRequest { app_id })
        .await?;
    Ok((
        StatusCode::OK,
        Json(json!({ "stopped_process_id": result.stopped_process_id })),
    )
        .into_response())
}

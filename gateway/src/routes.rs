// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandbox_fs::{FsError, FsErrorKind, SandboxFs};
use serde_derive::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use worker_pool::{PoolError, WorkerHandle, WorkerPool};

use crate::config::Config;
use crate::dto::{
    ExecuteRequest, ExecuteResponse, ExportResultItem, FileDeleteRequest, FileExportRequest,
    FileExportResponse, FileUploadRequest, FileUploadResponse, StatusResponse, UploadResultItem,
    UserParam, MAX_CODE_BYTES,
};
use crate::{auth, dto};

const GENERIC_ERROR: &str =
    "Internal server error. Please try again later or contact the administrator.";

#[derive(Clone)]
pub struct AppState {
    pub pool: WorkerPool,
    pub config: Arc<Config>,
    pub auth_token: Arc<String>,
    /// Pooled client for gateway→worker traffic.
    pub worker_client: reqwest::Client,
    /// Separate client for presigned-URL transfers: redirects disabled.
    pub transfer_client: reqwest::Client,
}

/// A response-shaped error; every handler error funnels through this.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorDetail { detail: self.detail })).into_response()
    }
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> ApiError {
        ApiError {
            status,
            detail: detail.into(),
        }
    }

    fn unprocessable(detail: String) -> ApiError {
        ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> ApiError {
        match e {
            PoolError::Capacity(_) | PoolError::Provision(_) => {
                log::error!("Worker provisioning failed: {e}");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Could not provision a new worker environment at this time.",
                )
            }
            PoolError::ShuttingDown => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            PoolError::NoSession => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
        }
    }
}

impl From<FsError> for ApiError {
    fn from(e: FsError) -> ApiError {
        let status = match e.kind() {
            FsErrorKind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            FsErrorKind::Path | FsErrorKind::Security => StatusCode::BAD_REQUEST,
            FsErrorKind::NotFound => StatusCode::NOT_FOUND,
            FsErrorKind::Download | FsErrorKind::Upload => StatusCode::BAD_GATEWAY,
            FsErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("File operation failed: {e}");
            ApiError::new(status, GENERIC_ERROR)
        } else {
            ApiError::new(status, e.to_string())
        }
    }
}

async fn verify_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get("x-auth-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !auth::tokens_match(provided, &state.auth_token) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid or missing authentication token",
        ));
    }
    Ok(next.run(request).await)
}

fn sandbox_fs_for(state: &AppState, handle: &WorkerHandle) -> SandboxFs {
    SandboxFs::new(
        handle.mount_point.clone(),
        state.transfer_client.clone(),
        state.pool.file_op_semaphore(),
        state.config.ssrf_protection_enabled,
    )
}

async fn execute(
    State(state): State<AppState>,
    Query(user): Query<UserParam>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Response, ApiError> {
    dto::validate_execute(&request).map_err(ApiError::unprocessable)?;
    let handle = state.pool.acquire(user.user_uuid).await?;

    let result = handle
        .execute(&state.worker_client, &request.code, state.config.proxy_timeout())
        .await;

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            log::error!(
                "Failed to proxy request to worker {}: {e}",
                handle.container_name
            );
            release_quietly(&state, user).await;
            return Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "Gateway Timeout: Could not connect to the execution worker. \
                 The environment has been reset, please try again.",
            ));
        }
    };

    match result.status {
        200 => {
            let payload = result.payload.unwrap_or_default();
            Ok(Json(ExecuteResponse {
                result_text: payload.result_text,
                result_base64: payload.result_base64,
            })
            .into_response())
        }
        400 => {
            // User code raised: the worker is still healthy and the session
            // keeps its state.
            log::debug!(
                "Worker {} reported an execution error: {}",
                handle.container_name,
                result.text
            );
            Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                extract_detail(&result.text),
            ))
        }
        503 => {
            log::warn!(
                "Worker {} returned 503, releasing worker",
                handle.container_name
            );
            release_quietly(&state, user).await;
            Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "The code resulted in an execution timeout or crashed environment. \
                 The environment has been reset, please try again.",
            ))
        }
        status => {
            log::error!(
                "Worker {} returned unexpected status {status}",
                handle.container_name
            );
            release_quietly(&state, user).await;
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                GENERIC_ERROR,
            ))
        }
    }
}

async fn release_quietly(state: &AppState, user: UserParam) {
    if let Err(e) = state.pool.release_user(user.user_uuid).await {
        log::warn!("Release after worker fault failed: {e}");
    }
}

/// Pull the `detail` field out of a worker error body, falling back to the
/// raw body.
fn extract_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(|detail| detail.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.to_owned())
}

async fn upload_files(
    State(state): State<AppState>,
    Query(user): Query<UserParam>,
    Json(request): Json<FileUploadRequest>,
) -> Result<Response, ApiError> {
    dto::validate_uploads(&request).map_err(ApiError::unprocessable)?;
    // Acquire-or-create: uploading ahead of the first execute is allowed and
    // pins the session to a worker.
    let handle = state.pool.acquire(user.user_uuid).await?;
    let fs = sandbox_fs_for(&state, &handle);

    let items: Vec<sandbox_fs::UploadItem> = request
        .files
        .iter()
        .map(|item| sandbox_fs::UploadItem {
            path: item.path.clone(),
            name: item.name.clone(),
            download_url: item.download_url.clone(),
        })
        .collect();
    let results = fs
        .upload_files(&items, state.config.max_file_size_bytes())
        .await?;

    let results = results
        .into_iter()
        .map(|uploaded| UploadResultItem {
            full_path: uploaded.full_path,
            size: uploaded.size,
        })
        .collect();
    Ok((
        StatusCode::CREATED,
        Json(FileUploadResponse {
            success: true,
            results,
        }),
    )
        .into_response())
}

async fn export_files(
    State(state): State<AppState>,
    Query(user): Query<UserParam>,
    Json(request): Json<FileExportRequest>,
) -> Result<Response, ApiError> {
    dto::validate_exports(&request).map_err(ApiError::unprocessable)?;
    let handle = state
        .pool
        .existing_handle(user.user_uuid)
        .await
        .ok_or(PoolError::NoSession)?;
    let fs = sandbox_fs_for(&state, &handle);

    let items: Vec<sandbox_fs::ExportItem> = request
        .files
        .iter()
        .map(|item| sandbox_fs::ExportItem {
            path: item.path.clone(),
            name: item.name.clone(),
            upload_url: item.upload_url.clone(),
        })
        .collect();
    let results = fs.export_files(&items).await?;

    let results = results
        .into_iter()
        .map(|exported| ExportResultItem {
            path: exported.path,
            name: exported.name,
            size: exported.size,
        })
        .collect();
    Ok(Json(FileExportResponse {
        success: true,
        results,
    })
    .into_response())
}

async fn delete_files(
    State(state): State<AppState>,
    Query(user): Query<UserParam>,
    Json(request): Json<FileDeleteRequest>,
) -> Result<Response, ApiError> {
    dto::validate_deletes(&request).map_err(ApiError::unprocessable)?;
    let handle = state
        .pool
        .existing_handle(user.user_uuid)
        .await
        .ok_or(PoolError::NoSession)?;
    let fs = sandbox_fs_for(&state, &handle);

    let items: Vec<sandbox_fs::FileRef> = request
        .files
        .iter()
        .map(|item| sandbox_fs::FileRef {
            path: item.path.clone(),
            name: item.name.clone(),
        })
        .collect();
    fs.delete_files(&items).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn release(
    State(state): State<AppState>,
    Query(user): Query<UserParam>,
) -> Result<Response, ApiError> {
    state.pool.release_user(user.user_uuid).await?;
    log::info!("Released worker for user {}", user.user_uuid);
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.pool.status().await;
    Json(StatusResponse {
        total_workers: status.total_workers,
        busy_workers: status.busy_workers,
        is_initializing: status.is_initializing,
    })
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_allowed_origins == ["*"] {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

///
/// The full API surface. Every route except `/status` sits behind the token
/// check.
///
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/v1/execute",
            post(execute).layer(DefaultBodyLimit::max(MAX_CODE_BYTES + 1024 * 1024)),
        )
        .route(
            "/api/v1/files",
            post(upload_files).delete(delete_files),
        )
        .route("/api/v1/files/export", post(export_files))
        .route("/api/v1/release", post(release))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            verify_token,
        ));

    Router::new()
        .route("/api/v1/status", get(status))
        .merge(protected)
        .layer(cors_layer(&state.config))
        .with_state(state)
}

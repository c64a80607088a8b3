// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

//! The in-sandbox agent: a small HTTP app in front of the container's
//! language kernel. Authentication is handled by the gateway; this service is
//! only reachable on the isolated worker network.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kernel_client::{ExecutionStatus, KernelSession, ResultKind};
use serde_derive::{Deserialize, Serialize};

const KERNEL_HOST: &str = "127.0.0.1:8888";
const BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 120;

#[derive(Deserialize)]
struct ExecuteRequest {
    code: String,
}

#[derive(Serialize)]
struct ExecuteResponse {
    result_text: Option<String>,
    result_base64: Option<String>,
}

#[derive(Serialize)]
struct ErrorDetail {
    detail: String,
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (
        status,
        Json(ErrorDetail {
            detail: detail.to_owned(),
        }),
    )
        .into_response()
}

async fn execute(
    State(kernel): State<Arc<KernelSession>>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let result = kernel.execute(&request.code).await;
    log::debug!("Execution result: {result:?}");

    match result.status {
        ExecutionStatus::Ok => {
            let is_image = result.kind == ResultKind::ImagePngBase64;
            Json(ExecuteResponse {
                result_base64: if is_image { result.value.clone() } else { None },
                result_text: if is_image { None } else { result.value },
            })
            .into_response()
        }
        ExecutionStatus::Timeout => {
            log::error!("Code execution timed out. This worker is now considered unhealthy.");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Code execution timed out. This worker instance is now considered unhealthy \
                 and should be killed.",
            )
        }
        ExecutionStatus::KernelDead => {
            log::error!("Kernel dead. This worker is now considered unhealthy.");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Code execution environment dead. This worker instance is now considered \
                 unhealthy and should be killed.",
            )
        }
        ExecutionStatus::Error => match result.kind {
            ResultKind::ConnectionError => {
                log::error!("Kernel connection lost. This worker is now considered unhealthy.");
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Code execution environment dead. This worker instance is now considered \
                     unhealthy and should be killed.",
                )
            }
            _ => {
                let message = result.value.unwrap_or_default();
                log::warn!("Execution failed: {message}");
                error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Execution error: {message}"),
                )
            }
        },
    }
}

async fn health(State(kernel): State<Arc<KernelSession>>) -> Response {
    if kernel.is_healthy().await {
        Json(serde_json::json!({"status": "ok"})).into_response()
    } else {
        log::warn!("Health check failed (kernel state: {:?})", kernel.state().await);
        error_response(StatusCode::SERVICE_UNAVAILABLE, "Kernel is not healthy")
    }
}

async fn reset(State(kernel): State<Arc<KernelSession>>) -> Response {
    match kernel.reset().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            log::error!("Kernel reset failed: {e}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to reset kernel.",
            )
        }
    }
}

fn execution_timeout_from_env() -> Duration {
    let secs = std::env::var("EXECUTION_TIMEOUT")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_EXECUTION_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    log::info!("Worker agent is starting up...");

    let kernel = Arc::new(KernelSession::new(KERNEL_HOST, execution_timeout_from_env()));
    if let Err(e) = kernel.start().await {
        log::error!("FATAL: {e}");
        std::process::exit(1);
    }

    let app = Router::new()
        .route("/api/v1/kernel/execute", post(execute))
        .route("/api/v1/kernel/health", get(health))
        .route("/api/v1/kernel/reset", post(reset))
        .with_state(kernel);

    let listener = match tokio::net::TcpListener::bind(BIND_ADDR).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("FATAL: could not bind {BIND_ADDR}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("Worker agent listening on {BIND_ADDR}");
    if let Err(e) = axum::serve(listener, app).await {
        log::error!("Worker agent server error: {e}");
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API.
//!
//! Thin JSON adapter over [`TaskService`]:
//!
//! | Method | Path | |
//! |---|---|---|
//! | `POST` | `/api/v1/task/run` | submit a task (`202`) |
//! | `POST` | `/api/v1/task/status` | task record, correlated by template/container |
//! | `GET` | `/api/v1/task/{task_id}/log` | incremental log lines |
//! | `POST` | `/api/v1/task/{task_id}/cancel` | idempotent cancellation |
//! | `GET` | `/health` | liveness |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::Error;
use crate::service::{LogChunk, TaskService};
use crate::task::{TaskHandle, TaskRequest, TaskStatus};

/// Error response wrapper: maps [`Error`] to a status code and `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError(
    /// The underlying error
    pub Error,
);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Error::TaskExists(_) => StatusCode::CONFLICT,
            Error::Launch(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, kind = self.0.kind(), "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
                kind: self.0.kind(),
            }),
        )
            .into_response()
    }
}

/// Status query body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    /// Template identity
    pub template_id: String,
    /// Task identity
    pub task_id: String,
    /// Container the caller believes runs the task
    #[serde(default)]
    pub container_id: Option<String>,
    /// Log offset the caller has consumed
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Task record as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    /// Template identity
    pub template_id: String,
    /// Task identity
    pub task_id: String,
    /// Container/process identifier, once launched
    pub container_id: Option<String>,
    /// Delivered log offset
    pub offset: usize,
    /// Task status
    pub status: TaskStatus,
    /// Exit code, when the unit exited on its own
    pub exit_code: Option<i32>,
    /// Failure description
    pub error: Option<String>,
}

impl From<TaskHandle> for TaskResponse {
    fn from(handle: TaskHandle) -> Self {
        Self {
            template_id: handle.template_id,
            task_id: handle.task_id,
            container_id: handle.container_id,
            offset: handle.log_offset,
            status: handle.status,
            exit_code: handle.exit_code,
            error: handle.error,
        }
    }
}

/// Log query parameters.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Start offset; defaults to the delivered offset
    pub offset: Option<usize>,
    /// Maximum lines to return
    pub max_lines: Option<usize>,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn run_task(
    State(service): State<Arc<TaskService>>,
    payload: std::result::Result<Json<TaskRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskResponse>)> {
    let Json(request) = payload?;
    let handle = service.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.into())))
}

async fn task_status(
    State(service): State<Arc<TaskService>>,
    payload: std::result::Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<Json<TaskResponse>> {
    let Json(query) = payload?;
    let handle = service
        .status(
            &query.template_id,
            &query.task_id,
            query.container_id.as_deref(),
            query.offset,
        )
        .await?;
    Ok(Json(handle.into()))
}

async fn task_log(
    State(service): State<Arc<TaskService>>,
    Path(task_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<LogChunk>> {
    let chunk = service
        .logs(&task_id, query.offset, query.max_lines)
        .await?;
    Ok(Json(chunk))
}

async fn cancel_task(
    State(service): State<Arc<TaskService>>,
    Path(task_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskResponse>)> {
    let handle = service.cancel(&task_id).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.into())))
}

async fn health(State(service): State<Arc<TaskService>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "launcher": service.launcher().launcher_type(),
        "activeTasks": service.active_count().await,
    }))
}

/// Build the API router.
pub fn router(service: Arc<TaskService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/task/run", post(run_task))
        .route("/api/v1/task/status", post(task_status))
        .route("/api/v1/task/{task_id}/log", get(task_log))
        .route("/api/v1/task/{task_id}/cancel", post(cancel_task))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve the API until `shutdown_rx` flips to `true`.
pub async fn run_server(
    listener: TcpListener,
    service: Arc<TaskService>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            info!("HTTP API received shutdown signal");
        })
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

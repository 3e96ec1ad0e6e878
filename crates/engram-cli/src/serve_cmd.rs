use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use engram_core::{EnqueueOptions, TaskQueue, TaskQueueError};
use engram_db::models::{TaskRecord, TaskStatus};
use engram_db::queries::queue as queue_db;
use engram_db::queries::tasks::TaskFilter;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<TaskQueueError> for AppError {
    fn from(err: TaskQueueError) -> Self {
        let status = match &err {
            TaskQueueError::UnknownKind(_) => StatusCode::BAD_REQUEST,
            TaskQueueError::DuplicateTask(_) => StatusCode::CONFLICT,
            TaskQueueError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskQueueError::NotRetryable { .. } => StatusCode::CONFLICT,
            TaskQueueError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            TaskQueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match err {
            TaskQueueError::Store(e) => format!("{e:#}"),
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub kind: String,
    pub group_id: String,
    /// Opaque to the queue; handlers define the shape.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    /// Caller-supplied id for idempotent enqueue.
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub task_id: Uuid,
}

/// Task row as exposed over the API: the raw payload stays internal, the
/// result is surfaced as text (handlers emit JSON in practice).
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub group_id: String,
    pub kind: String,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i32,
    pub message: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl From<TaskRecord> for TaskResponse {
    fn from(record: TaskRecord) -> Self {
        Self {
            id: record.id,
            group_id: record.group_id,
            kind: record.kind,
            status: record.status,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            progress: record.progress,
            message: record.message,
            result: record
                .result
                .map(|b| String::from_utf8_lossy(&b).into_owned()),
            error: record.error,
            entity_id: record.entity_id,
            entity_type: record.entity_type,
            worker_id: record.worker_id,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            stopped_at: record.stopped_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub group_id: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub entity_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
pub struct GroupDepthResponse {
    pub group_id: String,
    pub pending: i64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(queue: Arc<TaskQueue>) -> Router {
    Router::new()
        .route("/api/tasks", post(enqueue_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/stop", post(stop_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/progress", get(stream_task_progress))
        .route("/api/queue/groups", get(list_group_depths))
        .layer(CorsLayer::permissive())
        .with_state(queue)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(queue: Arc<TaskQueue>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(queue);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("engram serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("engram serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn enqueue_task(
    State(queue): State<Arc<TaskQueue>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, AppError> {
    let payload =
        serde_json::to_vec(&request.payload).map_err(|e| AppError::internal(e.into()))?;
    let task_id = queue
        .enqueue(
            &request.kind,
            &request.group_id,
            payload,
            EnqueueOptions {
                max_attempts: request.max_attempts,
                task_id: request.task_id,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(EnqueueResponse { task_id })))
}

async fn get_task(
    State(queue): State<Arc<TaskQueue>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let record = queue.get(id).await?;
    Ok(Json(record.into()))
}

async fn list_tasks(
    State(queue): State<Arc<TaskQueue>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskResponse>>, AppError> {
    let status = match &query.status {
        Some(s) => Some(
            s.parse::<TaskStatus>()
                .map_err(|e| AppError::bad_request(e.to_string()))?,
        ),
        None => None,
    };
    let filter = TaskFilter {
        group_id: query.group_id,
        kind: query.kind,
        status,
        entity_id: query.entity_id,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let records = queue.list(&filter, limit, offset).await?;
    Ok(Json(records.into_iter().map(TaskResponse::from).collect()))
}

async fn stop_task(
    State(queue): State<Arc<TaskQueue>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StopResponse>, AppError> {
    let accepted = queue.stop(id).await?;
    Ok(Json(StopResponse { accepted }))
}

async fn retry_task(
    State(queue): State<Arc<TaskQueue>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = queue.retry(id).await?;
    Ok((StatusCode::CREATED, Json(EnqueueResponse { task_id })))
}

async fn stream_task_progress(
    State(queue): State<Arc<TaskQueue>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let progress = queue.stream_progress(id).await?;
    let events = progress.map(|event| {
        let sse = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Ok(sse)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new()))
}

async fn list_group_depths(
    State(queue): State<Arc<TaskQueue>>,
) -> Result<Json<Vec<GroupDepthResponse>>, AppError> {
    let depths = queue_db::pending_depths(queue.pool())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(
        depths
            .into_iter()
            .map(|(group_id, pending)| GroupDepthResponse { group_id, pending })
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

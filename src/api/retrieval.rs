//! Ingest, task, and query handlers.

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::core::error::TidepoolError;
use crate::core::retrieval::{GeneratedAnswer, QueryResponse};
use crate::core::tasks::{TaskKind, TaskRecord};
use crate::core::vector::project_collection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize)]
pub struct IngestRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub project_id: Option<String>,
}

async fn with_deadline<T>(
    state: &AppState,
    fut: impl std::future::Future<Output = Result<T, TidepoolError>>,
) -> Result<T, TidepoolError> {
    let deadline = Duration::from_secs(state.config.request_timeout_secs.max(1));
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TidepoolError::DependencyUnavailable(format!(
            "request deadline of {}s exceeded",
            deadline.as_secs()
        ))),
    }
}

/// Spawn an ingest task for a file or directory; `202` + task id.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let project_id = state.resolve_project(request.project_id.as_deref())?;
    if !request.path.exists() {
        return Err(ApiError(TidepoolError::InvalidInput(format!(
            "path does not exist: {}",
            request.path.display()
        ))));
    }
    // A second pass over an already-populated collection is a reindex.
    let kind = {
        let name = project_collection(&project_id);
        if state.vectors.exists(&name) && state.vectors.open(&name)?.count()? > 0 {
            TaskKind::Reindex
        } else {
            TaskKind::Ingest
        }
    };
    let task = Arc::clone(&state.tasks).spawn_ingest(
        Arc::clone(&state.retrieval),
        kind,
        &project_id,
        request.path.clone(),
    );
    let _ = state.projects.touch(&project_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task.task_id,
            "project_id": project_id,
            "state": task.state,
        })),
    ))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    Ok(Json(state.tasks.get(&task_id)?))
}

/// Request cancellation; returns the current record (the worker lands the
/// cancelled state within one file's processing time).
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    Ok(Json(state.tasks.cancel(&task_id)?))
}

/// Raw retrieval without generation.
pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let project_id = state.resolve_project(request.project_id.as_deref())?;
    let response = with_deadline(
        &state,
        state
            .retrieval
            .query(&project_id, &request.question, request.k),
    )
    .await?;
    let _ = state.projects.touch(&project_id);
    Ok(Json(response))
}

/// Retrieval plus generation.
pub async fn query_llm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<GeneratedAnswer>, ApiError> {
    let project_id = state.resolve_project(request.project_id.as_deref())?;
    let response = with_deadline(
        &state,
        state
            .retrieval
            .query_with_generation(&project_id, &request.question, request.k),
    )
    .await?;
    let _ = state.projects.touch(&project_id);
    Ok(Json(response))
}

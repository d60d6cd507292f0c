//! Project lifecycle, decisions, objectives, and context export handlers.

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::core::error::TidepoolError;
use crate::core::events::{TOPIC_DECISION_ADDED, TOPIC_FOCUS_CHANGED};
use crate::core::project::{EventSeverity, Priority, Project};
use crate::core::tasks::TaskKind;
use crate::core::time;
use crate::core::vector::{project_collection, sacred_collection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub root_path: PathBuf,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
pub struct AddDecisionRequest {
    pub text: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

#[derive(Deserialize)]
pub struct AddObjectiveRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
}

fn parse_priority(raw: Option<&str>) -> Result<Priority, TidepoolError> {
    match raw {
        None | Some("medium") => Ok(Priority::Medium),
        Some("low") => Ok(Priority::Low),
        Some("high") => Ok(Priority::High),
        Some(other) => Err(TidepoolError::InvalidInput(format!(
            "priority must be low|medium|high, got '{other}'"
        ))),
    }
}

pub async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JsonValue>, ApiError> {
    let projects = state.projects.list()?;
    Ok(Json(json!({
        "projects": projects,
        "focused_project": state.projects.focused(),
    })))
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let project = state
        .projects
        .create(&request.name, &request.root_path, &request.description)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"project_id": &project.project_id, "project": &project})),
    ))
}

/// Create a project and immediately spawn a full ingest of its root.
pub async fn create_and_index(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let project = state
        .projects
        .create(&request.name, &request.root_path, &request.description)?;
    let task = Arc::clone(&state.tasks).spawn_ingest(
        Arc::clone(&state.retrieval),
        TaskKind::Ingest,
        &project.project_id,
        project.root_path.clone(),
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "project_id": project.project_id,
            "task_id": task.task_id,
        })),
    ))
}

pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.projects.get(&id)?))
}

pub async fn focus_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let changed = state.projects.focus(&id)?;
    if changed {
        let project = state.projects.get(&id)?;
        state.bus.publish(
            TOPIC_FOCUS_CHANGED,
            json!({"project_id": &id, "project_name": project.name}),
        );
    }
    Ok(Json(json!({"project_id": id, "focused": true, "changed": changed})))
}

pub async fn pause_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.projects.pause(&id)?))
}

pub async fn resume_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.projects.resume(&id)?))
}

/// Archive a project. Its collections are retained; only deletion removes
/// them.
pub async fn archive_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.projects.archive(&id)?))
}

pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let project = state.projects.delete(&id)?;
    state.vectors.drop_collection(&project_collection(&id))?;
    state.vectors.drop_collection(&sacred_collection(&id))?;
    Ok(Json(json!({
        "project_id": project.project_id,
        "deleted": true,
    })))
}

/// Export project context: record, decisions, objectives, statistics, and
/// the recent development-event tail.
pub async fn project_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let project = state.projects.get(&id)?;
    let (chunks, sources) = state.retrieval.stats(&id)?;
    let plans = state.sacred.list_plans(&id, None)?;
    let approved = plans
        .iter()
        .filter(|p| p.status == crate::core::sacred::PlanStatus::Approved)
        .count();
    let events = state.projects.recent_events(&id, 50)?;
    Ok(Json(json!({
        "project": &project,
        "decisions": &project.decisions,
        "objectives": &project.objectives,
        "statistics": {
            "indexed_chunks": chunks,
            "indexed_sources": sources,
            "plans": plans.len(),
            "approved_plans": approved,
        },
        "recent_events": events,
    })))
}

pub async fn add_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<AddDecisionRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let decision = state.projects.add_decision(
        &id,
        &request.text,
        &request.reasoning,
        &request.tags,
        &request.alternatives,
    )?;
    let mut payload = JsonMap::new();
    payload.insert("decision_id".into(), json!(&decision.decision_id));
    state
        .projects
        .record_event(&id, "decision_added", EventSeverity::Info, payload)?;
    state.bus.publish(
        TOPIC_DECISION_ADDED,
        json!({
            "project_id": id,
            "decision_id": &decision.decision_id,
            "timestamp": time::now_iso(),
        }),
    );
    Ok((StatusCode::CREATED, Json(json!({"decision": decision}))))
}

pub async fn add_objective(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<AddObjectiveRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let priority = parse_priority(request.priority.as_deref())?;
    let objective =
        state
            .projects
            .add_objective(&id, &request.title, &request.description, priority)?;
    Ok((StatusCode::CREATED, Json(json!({"objective": objective}))))
}

pub async fn complete_objective(
    State(state): State<Arc<AppState>>,
    Path((id, oid)): Path<(String, String)>,
) -> Result<Json<JsonValue>, ApiError> {
    let objective = state.projects.complete_objective(&id, &oid)?;
    Ok(Json(json!({"objective": objective})))
}

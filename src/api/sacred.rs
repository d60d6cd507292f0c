//! Sacred plan, drift, and analytics handlers.

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::core::drift::DriftAnalysis;
use crate::core::error::TidepoolError;
use crate::core::events::{TOPIC_SACRED_PLAN_APPROVED, TOPIC_SACRED_PLAN_CREATED};
use crate::core::sacred::{PlanStatus, SacredAnalytics};
use crate::core::time;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CreatePlanRequest {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_path: Option<std::path::PathBuf>,
}

#[derive(Deserialize)]
pub struct ApprovePlanRequest {
    pub approver: String,
    pub verification_code: String,
    pub secondary_verification: String,
}

#[derive(Deserialize)]
pub struct SupersedeRequest {
    pub new_plan_id: String,
}

#[derive(Deserialize)]
pub struct ListPlansParams {
    pub project_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct SacredQueryRequest {
    pub project_id: String,
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Deserialize)]
pub struct DriftParams {
    #[serde(default)]
    pub hours: Option<u64>,
}

#[derive(Deserialize)]
pub struct AnalyticsParams {
    #[serde(default)]
    pub timeframe: Option<u64>,
    #[serde(default)]
    pub project_filter: Option<String>,
}

/// Create a draft plan from inline content or a file on the server's
/// filesystem (the local-trust model allows path ingestion).
pub async fn create_plan(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    state.projects.get(&request.project_id)?;
    let content = match (&request.content, &request.file_path) {
        (Some(content), _) => content.clone(),
        (None, Some(path)) => {
            let metadata = std::fs::metadata(path).map_err(|e| {
                TidepoolError::InvalidInput(format!("file_path unreadable: {e}"))
            })?;
            if metadata.len() > state.config.max_file_bytes {
                return Err(ApiError(TidepoolError::InvalidInput(format!(
                    "plan file exceeds {} bytes",
                    state.config.max_file_bytes
                ))));
            }
            std::fs::read_to_string(path)
                .map_err(|e| TidepoolError::InvalidInput(format!("file_path unreadable: {e}")))?
        }
        (None, None) => {
            return Err(ApiError(TidepoolError::InvalidInput(
                "one of content or file_path is required".into(),
            )))
        }
    };

    let record = state
        .sacred
        .create_plan(&request.project_id, &request.title, &content)
        .await?;
    state.bus.publish(
        TOPIC_SACRED_PLAN_CREATED,
        json!({
            "project_id": &record.project_id,
            "plan_id": &record.plan_id,
            "title": &record.title,
        }),
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "plan_id": record.plan_id,
            "verification_code": record.verification_code,
            "status": record.status,
        })),
    ))
}

pub async fn approve_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ApprovePlanRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let record = state.sacred.approve_plan(
        &id,
        &request.verification_code,
        &request.secondary_verification,
        &request.approver,
    )?;
    state.bus.publish(
        TOPIC_SACRED_PLAN_APPROVED,
        json!({
            "project_id": &record.project_id,
            "plan_id": &record.plan_id,
            "approver": &request.approver,
            "timestamp": time::now_iso(),
        }),
    );
    Ok(Json(json!({
        "plan_id": record.plan_id,
        "status": record.status,
        "approval": record.approval,
    })))
}

pub async fn submit_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let record = state.sacred.submit_for_approval(&id)?;
    Ok(Json(json!({"plan_id": record.plan_id, "status": record.status})))
}

pub async fn archive_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let record = state.sacred.archive_plan(&id)?;
    Ok(Json(json!({"plan_id": record.plan_id, "status": record.status})))
}

pub async fn supersede_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SupersedeRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    state.sacred.supersede(&id, &request.new_plan_id)?;
    Ok(Json(json!({
        "superseded_plan_id": id,
        "new_plan_id": request.new_plan_id,
    })))
}

pub async fn list_plans(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListPlansParams>,
) -> Result<Json<JsonValue>, ApiError> {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => Some(PlanStatus::parse(raw).ok_or_else(|| {
            TidepoolError::InvalidInput(format!("unknown plan status '{raw}'"))
        })?),
    };
    let plans = state.sacred.list_plans(&params.project_id, status)?;
    let count = plans.len();
    Ok(Json(json!({"plans": plans, "count": count})))
}

pub async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let plan = state.sacred.get_plan(&id)?;
    Ok(Json(json!({
        "plan": plan.record,
        "content": plan.content,
    })))
}

pub async fn query_plans(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SacredQueryRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    state.projects.get(&request.project_id)?;
    let k = match request.k {
        Some(0) => {
            return Err(ApiError(TidepoolError::InvalidInput(
                "k must be positive".into(),
            )))
        }
        Some(k) => k.min(crate::core::retrieval::MAX_TOP_K),
        None => crate::core::retrieval::DEFAULT_TOP_K,
    };
    let hits = state
        .sacred
        .query_plans(&request.project_id, &request.query, k)
        .await?;
    Ok(Json(json!({
        "results": hits,
        "timestamp": time::now_iso(),
    })))
}

pub async fn drift(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(params): Query<DriftParams>,
) -> Result<Json<DriftAnalysis>, ApiError> {
    let hours = params.hours.unwrap_or(crate::core::drift::DEFAULT_WINDOW_HOURS);
    let deadline = std::time::Duration::from_secs(state.config.request_timeout_secs.max(1));
    let analysis = tokio::time::timeout(deadline, state.drift.analyze(&project_id, hours))
        .await
        .map_err(|_| {
            TidepoolError::DependencyUnavailable(format!(
                "drift analysis exceeded the {}s request deadline",
                deadline.as_secs()
            ))
        })??;
    Ok(Json(analysis))
}

pub async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<SacredAnalytics>, ApiError> {
    let timeframe = params.timeframe.unwrap_or(24 * 7);
    let report = state
        .sacred
        .analytics(timeframe, params.project_filter.as_deref())?;
    Ok(Json(report))
}

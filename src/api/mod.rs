//! HTTP + WebSocket API surface.
//!
//! The only ingress. Handlers validate requests, delegate to the owners
//! injected through [`AppState`], and translate owner errors into the
//! shared envelope; no domain state lives here. Long-running work
//! (ingestion) always goes through the task registry and returns `202`
//! with a task id.

pub mod error;
pub mod projects;
pub mod retrieval;
pub mod sacred;
pub mod ws;

use crate::core::chunker::Chunker;
use crate::core::config::Config;
use crate::core::drift::DriftEngine;
use crate::core::embed::Embedder;
use crate::core::error::TidepoolError;
use crate::core::events::EventBus;
use crate::core::generate::Generator;
use crate::core::project::ProjectRegistry;
use crate::core::retrieval::RetrievalEngine;
use crate::core::sacred::SacredStore;
use crate::core::tasks::TaskRegistry;
use crate::core::time;
use crate::core::vector::VectorStore;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Instrument};

/// Dependency-injected application state. Built once at startup; owners are
/// opened here and closed when the process exits.
pub struct AppState {
    pub config: Config,
    pub projects: Arc<ProjectRegistry>,
    pub sacred: Arc<SacredStore>,
    pub retrieval: Arc<RetrievalEngine>,
    pub tasks: Arc<TaskRegistry>,
    pub drift: Arc<DriftEngine>,
    pub bus: Arc<EventBus>,
    pub vectors: Arc<VectorStore>,
    embedding_healthy: AtomicBool,
    generation_healthy: AtomicBool,
}

impl AppState {
    /// Wire every owner against the given service clients. Tests pass
    /// deterministic in-process embedders and generators here.
    pub fn build(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Arc<AppState>, TidepoolError> {
        config.ensure_layout()?;
        let chunker = Chunker::new(config.chunk_target_chars, config.chunk_overlap_chars);

        let vectors = Arc::new(VectorStore::new(
            &config.vector_store_dir(),
            config.embedding_dim,
        )?);
        let projects = Arc::new(ProjectRegistry::new(&config.projects_dir())?);
        let sacred = Arc::new(SacredStore::new(
            &config.sacred_plans_dir(),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            &config.sacred_approval_key,
            chunker,
        )?);
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            generator,
            chunker,
            config.max_file_bytes,
            config.query_log_capacity,
        ));
        let bus = Arc::new(EventBus::new(256));
        let tasks = Arc::new(TaskRegistry::new(
            config.max_ingest_concurrency,
            Arc::clone(&bus),
        ));
        let drift = Arc::new(DriftEngine::new(
            Arc::clone(&sacred),
            Arc::clone(&retrieval),
            Arc::clone(&projects),
            embedder,
            config.drift_commit_path_ratio,
        ));

        // Re-apply any chunk-metadata rewrite a crash left half-done.
        let reconciled = sacred.reconcile_pending()?;
        if reconciled > 0 {
            info!(reconciled, "reconciled pending sacred commits at startup");
        }

        Ok(Arc::new(AppState {
            config,
            projects,
            sacred,
            retrieval,
            tasks,
            drift,
            bus,
            vectors,
            embedding_healthy: AtomicBool::new(true),
            generation_healthy: AtomicBool::new(true),
        }))
    }

    pub fn set_dependency_health(&self, embedding: bool, generation: bool) {
        self.embedding_healthy.store(embedding, Ordering::Relaxed);
        self.generation_healthy.store(generation, Ordering::Relaxed);
    }

    pub fn dependencies_healthy(&self) -> (bool, bool) {
        (
            self.embedding_healthy.load(Ordering::Relaxed),
            self.generation_healthy.load(Ordering::Relaxed),
        )
    }

    /// Resolve an explicit project id or fall back to the focused project.
    pub fn resolve_project(&self, explicit: Option<&str>) -> Result<String, TidepoolError> {
        if let Some(id) = explicit {
            self.projects.get(id)?;
            return Ok(id.to_string());
        }
        self.projects.focused().ok_or_else(|| {
            TidepoolError::InvalidInput(
                "no project_id given and no project is focused".into(),
            )
        })
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (embedding, generation) = state.dependencies_healthy();
    let status = if embedding && generation {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "embedding_service": embedding,
        "generation_service": generation,
        "timestamp": time::now_iso(),
    }))
}

/// Attach a request id to every request's trace span.
async fn request_span(request: Request, next: Next) -> Response {
    let request_id = time::new_event_id();
    let span = tracing::info_span!(
        "request",
        %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    next.run(request).instrument(span).await
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "no such route", "kind": "NotFound"})),
    )
}

/// Build the full router over the injected state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/create-and-index",
            post(projects::create_and_index),
        )
        .route(
            "/projects/{id}",
            get(projects::get_project).delete(projects::delete_project),
        )
        .route("/projects/{id}/focus", put(projects::focus_project))
        .route("/projects/{id}/pause", put(projects::pause_project))
        .route("/projects/{id}/resume", put(projects::resume_project))
        .route("/projects/{id}/archive", put(projects::archive_project))
        .route("/projects/{id}/context", get(projects::project_context))
        .route("/projects/{id}/decisions", post(projects::add_decision))
        .route("/projects/{id}/objectives", post(projects::add_objective))
        .route(
            "/projects/{id}/objectives/{oid}/complete",
            post(projects::complete_objective),
        )
        .route("/ingest", post(retrieval::ingest))
        .route("/tasks/{task_id}", get(retrieval::get_task))
        .route("/tasks/{task_id}/cancel", post(retrieval::cancel_task))
        .route("/query", post(retrieval::query))
        .route("/query_llm", post(retrieval::query_llm))
        .route(
            "/sacred/plans",
            get(sacred::list_plans).post(sacred::create_plan),
        )
        .route("/sacred/plans/{id}", get(sacred::get_plan))
        .route("/sacred/plans/{id}/approve", post(sacred::approve_plan))
        .route("/sacred/plans/{id}/submit", post(sacred::submit_plan))
        .route("/sacred/plans/{id}/archive", post(sacred::archive_plan))
        .route("/sacred/plans/{id}/supersede", post(sacred::supersede_plan))
        .route("/sacred/query", post(sacred::query_plans))
        .route("/sacred/drift/{project_id}", get(sacred::drift))
        .route("/analytics/sacred", get(sacred::analytics))
        .route("/ws", get(ws::ws_handler))
        .fallback(not_found)
        .layer(middleware::from_fn(request_span))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: Arc<AppState>) -> Result<(), TidepoolError> {
    let bind = state.config.http_bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(TidepoolError::Io)?;
    info!(%bind, "tidepool api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(TidepoolError::Io)?;
    Ok(())
}

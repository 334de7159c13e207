//! The webhook surface: six idempotent POST endpoints driving the
//! pipeline, plus read-only views for the operator.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use swarm_core::types::{ProjectName, RunId};
use swarm_gateway::types::{
    FixCompletePayload, OrchestratePayload, ReviewResultPayload, SpecCompletePayload,
    TaskCompletePayload, WorkerCompletePayload,
};

use crate::error::WebError;
use crate::state::WebState;

#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub status: &'static str,
    pub message: String,
}

impl Ack {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "ok",
            message: message.into(),
        })
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/worker-complete", post(worker_complete))
        .route("/task-complete", post(task_complete))
        .route("/review-result", post(review_result))
        .route("/fix-complete", post(fix_complete))
        .route("/spec-complete", post(spec_complete))
        .route("/orchestrate", post(orchestrate))
        .route("/api/escalations", get(list_escalations))
        .route("/api/runs/{run_id}", get(get_run))
        .route("/api/projects/{project}/run", get(get_project_run))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn worker_complete(
    State(state): State<WebState>,
    Json(payload): Json<WorkerCompletePayload>,
) -> Result<Json<Ack>, WebError> {
    state
        .run_blocking(move |orch| orch.handle_worker_complete(&payload))
        .await?;
    Ok(Ack::ok("worker completion processed"))
}

async fn task_complete(
    State(state): State<WebState>,
    Json(payload): Json<TaskCompletePayload>,
) -> Result<Json<Ack>, WebError> {
    state
        .run_blocking(move |orch| orch.handle_task_complete(&payload))
        .await?;
    Ok(Ack::ok("task completion processed"))
}

async fn review_result(
    State(state): State<WebState>,
    Json(payload): Json<ReviewResultPayload>,
) -> Result<Json<Ack>, WebError> {
    state
        .run_blocking(move |orch| orch.handle_review_result(&payload))
        .await?;
    Ok(Ack::ok("review result processed"))
}

async fn fix_complete(
    State(state): State<WebState>,
    Json(payload): Json<FixCompletePayload>,
) -> Result<Json<Ack>, WebError> {
    state
        .run_blocking(move |orch| orch.handle_fix_complete(&payload))
        .await?;
    Ok(Ack::ok("fix completion processed"))
}

async fn spec_complete(
    State(state): State<WebState>,
    Json(payload): Json<SpecCompletePayload>,
) -> Result<Json<Ack>, WebError> {
    state
        .run_blocking(move |orch| orch.handle_spec_complete(&payload))
        .await?;
    Ok(Ack::ok("spec completion processed"))
}

async fn orchestrate(
    State(state): State<WebState>,
    Json(payload): Json<OrchestratePayload>,
) -> Result<Json<Ack>, WebError> {
    state
        .run_blocking(move |orch| orch.orchestrate(&payload))
        .await?;
    Ok(Ack::ok("orchestration triggered"))
}

async fn list_escalations(
    State(state): State<WebState>,
) -> Result<Json<serde_json::Value>, WebError> {
    let open = state
        .run_blocking(move |orch| Ok(orch.escalations.list_open()?))
        .await?;
    Ok(Json(serde_json::json!({ "escalations": open })))
}

async fn get_run(
    State(state): State<WebState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, WebError> {
    let lookup = run_id.clone();
    let run = state
        .run_blocking(move |orch| Ok(orch.runs.get(&RunId::new(lookup))?))
        .await?
        .ok_or(WebError::NotFound {
            resource: format!("run:{run_id}"),
        })?;
    Ok(Json(serde_json::json!({ "run": run })))
}

async fn get_project_run(
    State(state): State<WebState>,
    Path(project): Path<String>,
) -> Result<Json<serde_json::Value>, WebError> {
    let lookup = project.clone();
    let run = state
        .run_blocking(move |orch| {
            Ok(orch.runs.active_run_for_project(&ProjectName::new(lookup))?)
        })
        .await?;
    Ok(Json(serde_json::json!({ "run": run })))
}

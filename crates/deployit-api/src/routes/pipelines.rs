//! Pipeline listing and manual triggers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use deployit_core::pipeline::{Pipeline, RunStatus, TriggerInfo, TriggerKind};
use deployit_core::source::Revision;
use deployit_scheduler::{Submitted, TriggerRequest};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pipelines))
        .route("/{name}", get(get_pipeline))
        .route("/{name}/trigger", post(trigger_run))
}

#[derive(Debug, Serialize)]
struct PipelineResponse {
    id: String,
    name: String,
    source: String,
    branch: String,
    stages: Vec<StageResponse>,
    latest_run: Option<LatestRun>,
}

#[derive(Debug, Serialize)]
struct StageResponse {
    name: String,
    kind: Option<String>,
    actions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LatestRun {
    id: String,
    number: u64,
    status: RunStatus,
}

async fn describe(state: &AppState, pipeline: &Pipeline) -> PipelineResponse {
    let latest_run = state
        .history
        .latest(pipeline.name())
        .await
        .map(|run| LatestRun {
            id: run.id.to_string(),
            number: run.number,
            status: run.status,
        });
    PipelineResponse {
        id: pipeline.id().to_string(),
        name: pipeline.name().to_string(),
        source: pipeline.source().full_name(),
        branch: pipeline.source().branch.clone(),
        stages: pipeline
            .stages()
            .iter()
            .map(|s| StageResponse {
                name: s.name.clone(),
                kind: s.kind().map(|k| k.to_string()),
                actions: s.actions.iter().map(|a| a.name.clone()).collect(),
            })
            .collect(),
        latest_run,
    }
}

async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<PipelineResponse>> {
    let mut response = Vec::with_capacity(state.pipelines.len());
    for pipeline in state.pipelines.values() {
        response.push(describe(&state, pipeline).await);
    }
    Json(response)
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PipelineResponse>, ApiError> {
    let pipeline = state
        .pipeline(&name)
        .ok_or_else(|| ApiError::NotFound(format!("Pipeline '{}' not found", name)))?;
    Ok(Json(describe(&state, pipeline).await))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRunRequest {
    /// Build this revision instead of the current head.
    revision: Option<String>,
    actor: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerRunResponse {
    pipeline: String,
    position: usize,
    replaced: bool,
}

/// Queue a manual run. The body is optional.
async fn trigger_run(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerRunResponse>), ApiError> {
    if state.pipeline(&name).is_none() {
        return Err(ApiError::NotFound(format!("Pipeline '{}' not found", name)));
    }

    let request: TriggerRunRequest = if body.is_empty() {
        TriggerRunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?
    };

    let mut trigger = match request.revision.filter(|r| !r.trim().is_empty()) {
        Some(revision) => TriggerInfo::at(TriggerKind::Manual, Revision::new(revision.trim())),
        None => TriggerInfo::manual(),
    };
    trigger.actor = request.actor;

    let submitted = state.queue.submit(TriggerRequest::new(&name, trigger)).await;
    info!(pipeline = %name, "Manual run requested");

    let (position, replaced) = match submitted {
        Submitted::Queued { position } => (position, false),
        Submitted::Replaced { position } => (position, true),
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerRunResponse {
            pipeline: name,
            position,
            replaced,
        }),
    ))
}

//! Run history endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use deployit_core::RunId;
use deployit_core::pipeline::PipelineRun;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs))
        .route("/{id}", get(get_run))
        .route("/{id}/cancel", post(cancel_run))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    pipeline: Option<String>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Json<Vec<PipelineRun>> {
    let runs = state
        .history
        .list(query.pipeline.as_deref(), query.limit.unwrap_or(DEFAULT_LIMIT))
        .await;
    Json(runs)
}

fn parse_run_id(id: &str) -> Result<RunId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid run id '{}': {}", id, e)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineRun>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state
        .history
        .get(run_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", run_id)))?;
    Ok(Json(run))
}

/// Ask a run to stop before its next stage.
async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let run_id = parse_run_id(&id)?;
    state.history.cancel(run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run_id.to_string(), "status": "cancelling" })),
    ))
}

//! Job submission through quota admission, and completion.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use super::error::{json_body, retry_later};
use crate::error::{FleetError, Result};
use crate::jobs::JobRecord;
use crate::quota::Admission;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/jobs", post(submit))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/complete", post(complete))
}

#[derive(Deserialize)]
struct SubmitBody {
    organization_id: String,
    cost: u64,
}

async fn submit(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SubmitBody>, JsonRejection>,
) -> Result<Response> {
    let body = json_body(payload)?;
    let _conn = state.fleet.pool.acquire().await?;
    match state
        .fleet
        .quota
        .submit_job(&body.organization_id, body.cost)
        .await
    {
        Ok(admission) => Ok((StatusCode::CREATED, Json::<Admission>(admission)).into_response()),
        // Admission gave up under contention; the job was not queued.
        Err(e) if e.is_contention() => Ok(retry_later(&e)),
        Err(e) => Err(e),
    }
}

#[derive(Deserialize)]
struct CompleteBody {
    succeeded: bool,
}

async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<CompleteBody>, JsonRejection>,
) -> Result<Json<JobRecord>> {
    let id = parse_id(&id)?;
    let body = json_body(payload)?;
    let _conn = state.fleet.pool.acquire().await?;
    Ok(Json(state.fleet.jobs.complete(id, body.succeeded).await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobRecord>> {
    Ok(Json(state.fleet.jobs.get(parse_id(&id)?).await?))
}

pub(super) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| FleetError::validation(format!("invalid id: {raw}")))
}

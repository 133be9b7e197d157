//! Heartbeat ingest and registry reads.

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::Deserialize;

use super::AppState;
use super::error::json_body;
use crate::error::Result;
use crate::registry::{HeartbeatReport, WorkerDetail, WorkerHistoryPoint, WorkerStats};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/workers", get(list_workers))
        .route("/api/workers/heartbeat", post(heartbeat))
        .route("/api/workers/stats", get(stats))
        .route("/api/workers/history", get(history))
        .route("/api/workers/{id}", get(get_worker))
}

async fn heartbeat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<HeartbeatReport>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let report = json_body(payload)?;
    let _conn = state.fleet.pool.acquire().await?;
    let worker_id = state.fleet.registry.record_heartbeat(report).await?;
    Ok(Json(serde_json::json!({ "worker_id": worker_id })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<WorkerStats>> {
    Ok(Json(state.fleet.registry.stats().await?))
}

async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<WorkerDetail>>> {
    Ok(Json(state.fleet.registry.details().await?))
}

async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkerDetail>> {
    Ok(Json(state.fleet.registry.get_worker(&id).await?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_days")]
    days: u32,
}

fn default_days() -> u32 {
    7
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<WorkerHistoryPoint>>> {
    Ok(Json(state.fleet.registry.history(query.days).await?))
}

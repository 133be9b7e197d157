//! Autoscaler trigger and event log.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
};

use super::auth::require_bearer;
use super::{AppState, LimitQuery};
use crate::autoscale::{ScalingEvent, TickReport};
use crate::error::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/autoscale/tick", post(tick))
        .route("/api/autoscale/events", get(events))
}

async fn tick(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<TickReport>> {
    require_bearer(&headers, state.scheduler_token.as_ref(), "scheduler")?;
    Ok(Json(state.fleet.autoscaler.tick().await?))
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ScalingEvent>>> {
    Ok(Json(state.fleet.autoscaler.recent_events(query.limit).await?))
}

//! Alert check trigger and audit log.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
};

use super::auth::require_bearer;
use super::{AppState, LimitQuery};
use crate::alerts::{AuditEntry, ScheduledCheckReport};
use crate::error::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/alerts/check", post(check))
        .route("/api/alerts/audit", get(audit))
}

async fn check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ScheduledCheckReport>> {
    require_bearer(&headers, state.scheduler_token.as_ref(), "scheduler")?;
    Ok(Json(state.fleet.alerts.run_scheduled_check().await?))
}

async fn audit(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<AuditEntry>>> {
    Ok(Json(state.fleet.alerts.recent_audit(query.limit).await?))
}

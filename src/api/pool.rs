//! Connection pool monitoring and maintenance.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
};
use serde::Deserialize;

use super::AppState;
use super::auth::require_bearer;
use crate::error::{FleetError, Result};
use crate::pool::{ConfigureReport, PoolSnapshot, ResetReport};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/pool/stats", get(stats))
        .route("/api/pool/history", get(history))
        .route("/api/pool/reset", post(reset))
        .route("/api/pool/configure", post(configure))
}

async fn stats(State(state): State<AppState>) -> Result<Json<PoolSnapshot>> {
    Ok(Json(state.fleet.pool.stats().await?))
}

#[derive(Deserialize)]
struct HoursQuery {
    #[serde(default = "default_hours")]
    hours: u32,
}

fn default_hours() -> u32 {
    24
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HoursQuery>,
) -> Result<Json<Vec<PoolSnapshot>>> {
    Ok(Json(state.fleet.pool.history(query.hours).await?))
}

// Maintenance handlers must not hold a pool lease themselves: reset waits for
// every outstanding lease to drain.

async fn reset(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<ResetReport>> {
    require_bearer(&headers, state.admin_token.as_ref(), "admin")?;
    Ok(Json(state.fleet.pool.reset().await?))
}

#[derive(Deserialize, Default)]
struct ConfigureBody {
    target_size: Option<u32>,
}

async fn configure(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ConfigureReport>> {
    require_bearer(&headers, state.admin_token.as_ref(), "admin")?;
    // An empty body asks for the recommended size.
    let body: ConfigureBody = if body.is_empty() {
        ConfigureBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| FleetError::validation(format!("invalid body: {e}")))?
    };
    let target = match body.target_size {
        Some(size) => size,
        None => state.fleet.pool.recommended_size().await?,
    };
    Ok(Json(state.fleet.pool.configure(target).await?))
}

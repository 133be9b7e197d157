//! Organization quotas and increase requests.

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;

use super::AppState;
use super::error::json_body;
use super::jobs::parse_id;
use crate::error::{FleetError, Result};
use crate::quota::{OrganizationQuota, QuotaIncrease, QuotaRequest, RequestStatus, ReviewDecision};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/quota/requests", get(list_requests).post(create_request))
        .route("/api/quota/requests/{id}", get(get_request))
        .route("/api/quota/requests/{id}/review", post(review))
        .route("/api/quota/{org}", get(get_quota))
}

async fn get_quota(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> Result<Json<OrganizationQuota>> {
    Ok(Json(state.fleet.quota.get_quota(&org).await?))
}

#[derive(Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<QuotaRequest>>> {
    let status = query
        .status
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<RequestStatus>())
        .transpose()
        .map_err(FleetError::Validation)?;
    Ok(Json(state.fleet.quota.list_requests(status).await?))
}

async fn create_request(
    State(state): State<AppState>,
    payload: std::result::Result<Json<QuotaIncrease>, JsonRejection>,
) -> Result<(StatusCode, Json<QuotaRequest>)> {
    let body = json_body(payload)?;
    let _conn = state.fleet.pool.acquire().await?;
    let request = state.fleet.quota.request_increase(body).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QuotaRequest>> {
    Ok(Json(state.fleet.quota.get_request(parse_id(&id)?).await?))
}

#[derive(Deserialize)]
struct ReviewBody {
    #[serde(default)]
    approver_id: String,
    decision: ReviewDecision,
}

async fn review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<ReviewBody>, JsonRejection>,
) -> Result<Json<QuotaRequest>> {
    let id = parse_id(&id)?;
    let body = json_body(payload)?;
    let _conn = state.fleet.pool.acquire().await?;
    let request = state
        .fleet
        .quota
        .review(id, &body.approver_id, body.decision)
        .await?;
    Ok(Json(request))
}

//! HTTP surface.
//!
//! Trigger endpoints (`/api/autoscale/tick`, `/api/alerts/check`) take the
//! scheduler's bearer token; pool maintenance takes the admin token. Every
//! error body is `{"error", "message"}` except single-flight contention,
//! which answers `200 {"status": "in_progress"}`. Job admission that gives up
//! under contention answers 503 with `Retry-After` instead.

pub mod alerts;
pub mod auth;
pub mod autoscale;
pub mod error;
pub mod jobs;
pub mod pool;
pub mod quota;
pub mod workers;

use std::sync::Arc;

use axum::{Json, Router, response::IntoResponse, routing::get};
use secrecy::SecretString;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::fleet::Fleet;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub scheduler_token: Option<SecretString>,
    pub admin_token: Option<SecretString>,
}

impl AppState {
    pub fn new(fleet: Arc<Fleet>, server: &ServerConfig) -> Self {
        Self {
            fleet,
            scheduler_token: server.scheduler_token.clone(),
            admin_token: server.admin_token.clone(),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(workers::routes())
        .merge(autoscale::routes())
        .merge(jobs::routes())
        .merge(quota::routes())
        .merge(pool::routes())
        .merge(alerts::routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "worker-fleet",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

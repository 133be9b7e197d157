//! HTTP mapping of [`FleetError`].

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::error::FleetError;

/// Unwrap a JSON body, turning axum's rejection (bad syntax, wrong types,
/// missing content type) into a 400 validation error.
pub(super) fn json_body<T>(
    payload: std::result::Result<Json<T>, JsonRejection>,
) -> Result<T, FleetError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| FleetError::validation(rejection.body_text()))
}

/// 503 with `Retry-After` for work that was refused under contention and not
/// performed, unlike the single-flight jobs where `in_progress` means someone
/// else is already doing it.
pub(super) fn retry_later(err: &FleetError) -> Response {
    let body = serde_json::json!({
        "error": "contention",
        "message": err.to_string(),
    });
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(RETRY_AFTER, "1")],
        Json(body),
    )
        .into_response()
}

impl FleetError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            // Someone else is already doing it; not a failure for the caller.
            Self::ResourceContention { .. } => StatusCode::OK,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind for the `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Auth(_) => "unauthorized",
            Self::InvalidState { .. } => "invalid_state",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ResourceContention { .. } => "in_progress",
            Self::NotFound { .. } => "not_found",
            Self::Dependency(_) => "internal",
        }
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            Self::ResourceContention { operation } => serde_json::json!({
                "status": "in_progress",
                "operation": operation,
            }),
            Self::QuotaExceeded {
                organization_id,
                current_usage,
                limit,
                cost,
            } => serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
                "organization_id": organization_id,
                "current_usage": current_usage,
                "limit": limit,
                "cost": cost,
            }),
            Self::InvalidState { state, .. } => serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
                "state": state,
            }),
            Self::Dependency(e) => {
                error!(error = %e, "Request failed on a dependency");
                serde_json::json!({
                    "error": self.kind(),
                    "message": "Internal server error",
                })
            }
            _ => serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            FleetError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            FleetError::contention("autoscaler tick").status_code(),
            StatusCode::OK
        );
        let quota = FleetError::QuotaExceeded {
            organization_id: "org-1".into(),
            current_usage: 95,
            limit: 100,
            cost: 10,
        };
        assert_eq!(quota.status_code(), StatusCode::TOO_MANY_REQUESTS);
        let db: FleetError = DatabaseError::Query("secret table".into()).into();
        assert_eq!(db.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn retry_later_is_not_success() {
        let response = retry_later(&FleetError::contention("quota admission for acme"));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
    }

    #[tokio::test]
    async fn dependency_message_is_generic() {
        let err: FleetError = DatabaseError::Query("SELECT * FROM secrets".into()).into();
        let response = err.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "internal");
        assert_eq!(body["message"], "Internal server error");
    }
}

//! Quota types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest cost, usage or limit the store holds; columns are signed 64-bit.
pub const MAX_UNITS: u64 = i64::MAX as u64;

/// Per-organization usage ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationQuota {
    pub organization_id: String,
    pub limit: u64,
    pub current_usage: u64,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationQuota {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_usage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Approved => write!(f, "approved"),
            RequestStatus::Denied => write!(f, "denied"),
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "denied" => Ok(RequestStatus::Denied),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Deny,
}

impl ReviewDecision {
    /// Status a pending request ends in after this decision.
    pub fn resulting_status(self) -> RequestStatus {
        match self {
            ReviewDecision::Approve => RequestStatus::Approved,
            ReviewDecision::Deny => RequestStatus::Denied,
        }
    }
}

/// A request to raise an organization's limit.
///
/// `reviewed_by` and `reviewed_at` are set exactly when `status` is not
/// `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRequest {
    pub id: Uuid,
    pub organization_id: String,
    pub requested_by: String,
    pub request_type: String,
    pub current_limit: u64,
    pub requested_limit: u64,
    pub reason: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Input for a new quota increase request.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaIncrease {
    pub organization_id: String,
    pub requested_by: String,
    #[serde(default = "default_request_type")]
    pub request_type: String,
    pub requested_limit: u64,
    #[serde(default)]
    pub reason: String,
}

fn default_request_type() -> String {
    "job_usage".to_string()
}

/// Result of the storage-level review transaction.
#[derive(Debug, Clone)]
pub enum ReviewWrite {
    /// The request was pending and is now reviewed.
    Applied(QuotaRequest),
    /// The request had already been reviewed; nothing changed.
    NotPending(QuotaRequest),
    /// Approval refused: the organization's limit already meets the request.
    Superseded {
        request: QuotaRequest,
        current_limit: u64,
    },
    NotFound,
}

/// A job accepted by admission control.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub job_id: Uuid,
    pub organization_id: String,
    pub cost: u64,
    pub current_usage: u64,
    pub limit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_status_display_parse() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Denied,
        ] {
            let parsed: RequestStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!("APPROVED".parse::<RequestStatus>().unwrap(), RequestStatus::Approved);
    }

    #[test]
    fn decision_maps_to_status() {
        assert_eq!(ReviewDecision::Approve.resulting_status(), RequestStatus::Approved);
        assert_eq!(ReviewDecision::Deny.resulting_status(), RequestStatus::Denied);
    }

    #[test]
    fn decision_deserializes_lowercase() {
        let d: ReviewDecision = serde_json::from_str(r#""approve""#).unwrap();
        assert_eq!(d, ReviewDecision::Approve);
    }

    #[test]
    fn remaining_saturates() {
        let quota = OrganizationQuota {
            organization_id: "org".into(),
            limit: 100,
            current_usage: 120,
            updated_at: Utc::now(),
        };
        assert_eq!(quota.remaining(), 0);
    }
}

//! Alert check results, dedup records and the audit log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The sub-checks of a scheduled run, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    FailureRate,
    Performance,
}

impl CheckKind {
    pub const ORDERED: [CheckKind; 2] = [CheckKind::FailureRate, CheckKind::Performance];

    /// Dedup key for this check in the window starting at `window_start`.
    pub fn dedup_key(self, window_start: DateTime<Utc>) -> String {
        format!("{self}:{}", window_start.timestamp())
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::FailureRate => write!(f, "failure_rate"),
            CheckKind::Performance => write!(f, "performance"),
        }
    }
}

impl FromStr for CheckKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failure_rate" => Ok(CheckKind::FailureRate),
            "performance" => Ok(CheckKind::Performance),
            other => Err(format!("unknown check kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Alert,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "pass"),
            CheckStatus::Alert => write!(f, "alert"),
        }
    }
}

impl FromStr for CheckStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(CheckStatus::Pass),
            "alert" => Ok(CheckStatus::Alert),
            other => Err(format!("unknown check status: {other}")),
        }
    }
}

/// Outcome of one sub-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub message: String,
    /// Observed metrics and thresholds.
    pub details: serde_json::Value,
}

impl CheckResult {
    pub fn is_alert(&self) -> bool {
        self.status == CheckStatus::Alert
    }
}

/// The recorded result for one dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRun {
    pub dedup_key: String,
    pub window_start: DateTime<Utc>,
    pub result: CheckResult,
    pub created_at: DateTime<Utc>,
}

/// Append-only log line for every sub-check invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub dedup_key: String,
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub replayed: bool,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// A sub-check outcome as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub dedup_key: String,
    /// True when the result was recorded by an earlier invocation.
    pub replayed: bool,
    pub result: CheckResult,
}

/// Combined result of both sub-checks for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledCheckReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub failure_rate: CheckOutcome,
    pub performance: CheckOutcome,
}

impl ScheduledCheckReport {
    pub fn alerting(&self) -> bool {
        self.failure_rate.result.is_alert() || self.performance.result.is_alert()
    }
}

//! Autoscaling decisions and their audit trail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
        }
    }
}

impl FromStr for ScalingAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scale_up" => Ok(ScalingAction::ScaleUp),
            "scale_down" => Ok(ScalingAction::ScaleDown),
            other => Err(format!("unknown scaling action: {other}")),
        }
    }
}

/// What the controller wants to do this tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingDecision {
    ScaleUp { count: u32 },
    /// Only ever names INACTIVE workers.
    ScaleDown { worker_ids: Vec<String> },
    NoChange { reason: String },
}

impl ScalingDecision {
    pub fn action(&self) -> Option<ScalingAction> {
        match self {
            ScalingDecision::ScaleUp { .. } => Some(ScalingAction::ScaleUp),
            ScalingDecision::ScaleDown { .. } => Some(ScalingAction::ScaleDown),
            ScalingDecision::NoChange { .. } => None,
        }
    }

    pub fn is_no_change(&self) -> bool {
        matches!(self, ScalingDecision::NoChange { .. })
    }
}

/// Summary returned by one controller tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub active_workers: u32,
    pub inactive_workers: u32,
    pub queue_depth: u64,
    pub target: u32,
    pub decision: ScalingDecision,
    /// Whether the provisioner was called.
    pub executed: bool,
    /// Set when an action was withheld by the cooldown window.
    pub cooldown_until: Option<DateTime<Utc>>,
    pub evaluated_at: DateTime<Utc>,
}

/// One provisioning attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub id: Uuid,
    pub action: ScalingAction,
    pub requested: u32,
    pub worker_ids: Vec<String>,
    pub target: u32,
    pub active: u32,
    pub queue_depth: u64,
    pub succeeded: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

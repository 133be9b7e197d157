//! Connection pool snapshots and maintenance reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time utilization of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub recorded_at: DateTime<Utc>,
    pub active: u32,
    pub idle: u32,
    pub total: u32,
    pub max: u32,
}

impl PoolSnapshot {
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        f64::from(self.active) / f64::from(self.max)
    }
}

/// Outcome of a drain-and-reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Idle connections closed plus in-flight ones that drained in time.
    pub closed_gracefully: u32,
    pub force_closed: u32,
    pub in_flight_at_start: u32,
    pub elapsed_ms: u64,
}

/// Outcome of a resize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigureReport {
    pub previous_max: u32,
    pub new_max: u32,
    pub idle_trimmed: u32,
    pub peak_active: u32,
}

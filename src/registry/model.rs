//! Worker registry types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Health of a worker, derived from heartbeat staleness at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Failed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "ACTIVE"),
            WorkerStatus::Inactive => write!(f, "INACTIVE"),
            WorkerStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(WorkerStatus::Active),
            "INACTIVE" => Ok(WorkerStatus::Inactive),
            "FAILED" => Ok(WorkerStatus::Failed),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// The two staleness thresholds, `active < failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessThresholds {
    pub active: Duration,
    pub failed: Duration,
}

impl StalenessThresholds {
    /// Classify a worker by the age of its last heartbeat.
    pub fn classify(&self, age: Duration) -> WorkerStatus {
        if age < self.active {
            WorkerStatus::Active
        } else if age < self.failed {
            WorkerStatus::Inactive
        } else {
            WorkerStatus::Failed
        }
    }

    /// Classify a heartbeat timestamp as seen at `now`.
    ///
    /// A heartbeat stamped after `now` has age zero.
    pub fn status_at(&self, last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> WorkerStatus {
        let age = (now - last_heartbeat).to_std().unwrap_or(Duration::ZERO);
        self.classify(age)
    }
}

/// Stored state of a worker. Status is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

/// An incoming heartbeat, as reported by a worker.
///
/// `worker_id` defaults to empty so a missing id surfaces as a validation
/// error rather than a body rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatReport {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub jobs_processed: Option<u64>,
    #[serde(default)]
    pub jobs_failed: Option<u64>,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl HeartbeatReport {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_counters(mut self, processed: u64, failed: u64) -> Self {
        self.jobs_processed = Some(processed);
        self.jobs_failed = Some(failed);
        self
    }

    pub fn with_gauges(mut self, cpu: f64, memory: f64) -> Self {
        self.cpu_usage = Some(cpu);
        self.memory_usage = Some(memory);
        self
    }
}

/// A validated heartbeat ready to be applied at `received_at`.
#[derive(Debug, Clone)]
pub struct HeartbeatWrite {
    pub worker_id: String,
    pub received_at: DateTime<Utc>,
    pub jobs_processed: Option<u64>,
    pub jobs_failed: Option<u64>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

/// Worker counts grouped by derived status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub active: u32,
    pub inactive: u32,
    pub failed: u32,
    pub total: u32,
    pub computed_at: Option<DateTime<Utc>>,
}

impl WorkerStats {
    pub fn count(&mut self, status: WorkerStatus) {
        match status {
            WorkerStatus::Active => self.active += 1,
            WorkerStatus::Inactive => self.inactive += 1,
            WorkerStatus::Failed => self.failed += 1,
        }
        self.total += 1;
    }
}

/// A worker record together with its derived fields.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerDetail {
    #[serde(flatten)]
    pub record: WorkerRecord,
    pub status: WorkerStatus,
    pub uptime_hours: f64,
}

/// Immutable once its day has closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHistoryPoint {
    pub day: NaiveDate,
    pub active_count: u32,
    pub inactive_count: u32,
    pub failed_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> StalenessThresholds {
        StalenessThresholds {
            active: Duration::from_secs(120),
            failed: Duration::from_secs(600),
        }
    }

    #[test]
    fn classification_boundaries() {
        let t = thresholds();
        assert_eq!(t.classify(Duration::ZERO), WorkerStatus::Active);
        assert_eq!(t.classify(Duration::from_millis(119_999)), WorkerStatus::Active);
        assert_eq!(t.classify(Duration::from_secs(120)), WorkerStatus::Inactive);
        assert_eq!(t.classify(Duration::from_millis(599_999)), WorkerStatus::Inactive);
        assert_eq!(t.classify(Duration::from_secs(600)), WorkerStatus::Failed);
        assert_eq!(t.classify(Duration::from_secs(86_400)), WorkerStatus::Failed);
    }

    #[test]
    fn classification_matches_definition_for_all_ages() {
        let t = thresholds();
        for secs in 0..900u64 {
            let age = Duration::from_secs(secs);
            let expected = if age < t.active {
                WorkerStatus::Active
            } else if age < t.failed {
                WorkerStatus::Inactive
            } else {
                WorkerStatus::Failed
            };
            assert_eq!(t.classify(age), expected, "age {secs}s");
        }
    }

    #[test]
    fn future_heartbeat_counts_as_fresh() {
        let now = Utc::now();
        let status = thresholds().status_at(now + chrono::Duration::seconds(30), now);
        assert_eq!(status, WorkerStatus::Active);
    }

    #[test]
    fn status_display_parse() {
        for status in [WorkerStatus::Active, WorkerStatus::Inactive, WorkerStatus::Failed] {
            let parsed: WorkerStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("gone".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn heartbeat_without_worker_id_deserializes_empty() {
        let report: HeartbeatReport = serde_json::from_str(r#"{"jobs_processed": 3}"#).unwrap();
        assert!(report.worker_id.is_empty());
        assert_eq!(report.jobs_processed, Some(3));
    }
}

//! Job ledger: admitted jobs and their outcomes.
//!
//! The ledger is the queue-depth signal the autoscaler reads and the
//! failure/latency source the alert engine evaluates. What a job computes is
//! not modelled here.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{DatabaseError, FleetError, Result};
use crate::store::FleetStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Succeeded,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A job admitted through quota control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub organization_id: String,
    pub cost: u64,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
}

impl JobRecord {
    pub fn queued(organization_id: &str, cost: u64, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            cost,
            status: JobStatus::Queued,
            submitted_at,
            completed_at: None,
            latency_ms: None,
        }
    }
}

/// Aggregate of jobs completed inside a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutcomeSummary {
    pub total: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

impl JobOutcomeSummary {
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.failed as f64 / self.total as f64
    }
}

/// Source of the pending-job count.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn pending_depth(&self) -> std::result::Result<u64, DatabaseError>;
}

/// Records job outcomes and exposes queue depth.
pub struct JobLedger {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn FleetStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Mark a queued job as finished. Completing twice is an invalid state.
    pub async fn complete(&self, job_id: Uuid, succeeded: bool) -> Result<JobRecord> {
        let status = if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        let now = self.clock.now();

        if self.store.complete_job(job_id, status, now).await? {
            info!(job_id = %job_id, status = %status, "Job completed");
        }

        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })?;

        // Either we just wrote this outcome, or an identical retry already did.
        if job.status != status {
            return Err(FleetError::InvalidState {
                entity: "job",
                id: job_id.to_string(),
                state: job.status.to_string(),
                action: "complete",
            });
        }
        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<JobRecord> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })
    }
}

#[async_trait]
impl JobQueue for JobLedger {
    async fn pending_depth(&self) -> std::result::Result<u64, DatabaseError> {
        self.store.count_jobs(JobStatus::Queued).await
    }
}

//! `FleetStore`: the async interface for all fleet persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::alerts::{AlertRun, AuditEntry};
use crate::autoscale::ScalingEvent;
use crate::error::DatabaseError;
use crate::jobs::{JobOutcomeSummary, JobRecord, JobStatus};
use crate::pool::PoolSnapshot;
use crate::quota::{OrganizationQuota, QuotaRequest, RequestStatus, ReviewDecision, ReviewWrite};
use crate::registry::{HeartbeatWrite, WorkerHistoryPoint, WorkerRecord};

/// Backend-agnostic storage for workers, quotas, jobs, pool and alert data.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Apply a heartbeat in one statement: `first_seen` is set only on
    /// insert, counters never decrease.
    async fn upsert_heartbeat(&self, heartbeat: &HeartbeatWrite) -> Result<(), DatabaseError>;

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError>;

    /// All live (non-archived) workers ordered by id.
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError>;

    /// Move workers whose last heartbeat precedes `cutoff` into the archive.
    async fn archive_workers(
        &self,
        cutoff: DateTime<Utc>,
        archived_at: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    /// Write the history point for its day; the caller only passes today.
    async fn upsert_history_point(&self, point: &WorkerHistoryPoint) -> Result<(), DatabaseError>;

    /// The most recent `limit` points, oldest first.
    async fn list_history(&self, limit: u32) -> Result<Vec<WorkerHistoryPoint>, DatabaseError>;

    // ── Leases ──────────────────────────────────────────────────────

    /// Take `key` for `holder` if free or expired at `now_ms`.
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool, DatabaseError>;

    /// Release `key` if still held by `holder`.
    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, DatabaseError>;

    // ── Quotas ──────────────────────────────────────────────────────

    /// Fetch an organization's quota, creating it with `default_limit`.
    async fn ensure_organization(
        &self,
        organization_id: &str,
        default_limit: u64,
        now: DateTime<Utc>,
    ) -> Result<OrganizationQuota, DatabaseError>;

    async fn get_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationQuota>, DatabaseError>;

    /// Compare-and-increment: add `job.cost` to the organization's usage only
    /// if it still equals `expected_usage` and the result fits the limit, and
    /// record the job as queued in the same transaction. Returns false when
    /// the usage moved or the limit no longer allows it.
    async fn try_admit_job(
        &self,
        job: &JobRecord,
        expected_usage: u64,
    ) -> Result<bool, DatabaseError>;

    async fn insert_quota_request(&self, request: &QuotaRequest) -> Result<(), DatabaseError>;

    async fn get_quota_request(&self, id: Uuid) -> Result<Option<QuotaRequest>, DatabaseError>;

    /// Requests newest first, optionally filtered by status.
    async fn list_quota_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<QuotaRequest>, DatabaseError>;

    /// Review a pending request in one transaction, applying the requested
    /// limit on approval.
    async fn review_quota_request(
        &self,
        id: Uuid,
        reviewer: &str,
        decision: ReviewDecision,
        at: DateTime<Utc>,
    ) -> Result<ReviewWrite, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &JobRecord) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// Finish a queued job. Returns false if it was not queued.
    async fn complete_job(
        &self,
        id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn count_jobs(&self, status: JobStatus) -> Result<u64, DatabaseError>;

    /// Outcomes of jobs completed at or after `since`.
    async fn job_outcomes_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<JobOutcomeSummary, DatabaseError>;

    // ── Scaling ─────────────────────────────────────────────────────

    async fn insert_scaling_event(&self, event: &ScalingEvent) -> Result<(), DatabaseError>;

    async fn last_successful_scaling_event(&self) -> Result<Option<ScalingEvent>, DatabaseError>;

    async fn list_scaling_events(&self, limit: u32) -> Result<Vec<ScalingEvent>, DatabaseError>;

    // ── Connection pool ─────────────────────────────────────────────

    async fn insert_pool_snapshot(&self, snapshot: &PoolSnapshot) -> Result<(), DatabaseError>;

    async fn latest_pool_snapshot(&self) -> Result<Option<PoolSnapshot>, DatabaseError>;

    /// Snapshots recorded at or after `since`, oldest first.
    async fn list_pool_snapshots(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PoolSnapshot>, DatabaseError>;

    // ── Alerts ──────────────────────────────────────────────────────

    async fn get_alert_run(&self, dedup_key: &str) -> Result<Option<AlertRun>, DatabaseError>;

    /// Record a run unless its dedup key exists. Returns whether it was new.
    async fn insert_alert_run(&self, run: &AlertRun) -> Result<bool, DatabaseError>;

    async fn append_alert_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;

    /// Latest audit entries, newest first.
    async fn list_alert_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, DatabaseError>;
}

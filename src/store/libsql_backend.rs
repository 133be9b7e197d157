//! libSQL backend: async `FleetStore` implementation.
//!
//! Supports local file and in-memory databases. All statements go through a
//! single connection guarded by an async mutex, so a `BEGIN IMMEDIATE`
//! transaction never interleaves with another task's statements.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertRun, AuditEntry, CheckResult};
use crate::autoscale::ScalingEvent;
use crate::error::DatabaseError;
use crate::jobs::{JobOutcomeSummary, JobRecord, JobStatus};
use crate::pool::PoolSnapshot;
use crate::quota::{OrganizationQuota, QuotaRequest, RequestStatus, ReviewDecision, ReviewWrite};
use crate::registry::{HeartbeatWrite, WorkerHistoryPoint, WorkerRecord};
use crate::store::migrations;
use crate::store::traits::FleetStore;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed width, so text comparison orders it.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // SQLite datetime() output, with or without fractional seconds
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_json(v: Option<&serde_json::Value>) -> Result<libsql::Value, DatabaseError> {
    match v {
        Some(v) => serde_json::to_string(v)
            .map(libsql::Value::Text)
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
        None => Ok(libsql::Value::Null),
    }
}

fn col_text(row: &Row, idx: i32, op: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{op} column {idx}: {e}")))
}

fn col_int(row: &Row, idx: i32, op: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{op} column {idx}: {e}")))
}

fn col_real(row: &Row, idx: i32, op: &str) -> Result<f64, DatabaseError> {
    row.get::<f64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{op} column {idx}: {e}")))
}

/// Run a query and map every row.
async fn query_all<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// Run a query and map the first row, if any.
async fn query_one<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => map(&row).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

async fn begin_immediate(conn: &Connection, op: &str) -> Result<(), DatabaseError> {
    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))?;
    Ok(())
}

/// Commit on success, roll back on error.
async fn finish_tx<T>(
    conn: &Connection,
    op: &str,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", ())
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = conn.execute("ROLLBACK", ()).await {
                warn!(op, error = %e, "Rollback failed");
            }
            Err(err)
        }
    }
}

const WORKER_COLUMNS: &str = "worker_id, first_seen, last_heartbeat, jobs_processed, jobs_failed, cpu_usage, memory_usage, metadata";

fn row_to_worker(row: &Row) -> Result<WorkerRecord, DatabaseError> {
    let op = "row_to_worker";
    let metadata: Option<String> = row.get(7).ok();
    Ok(WorkerRecord {
        worker_id: col_text(row, 0, op)?,
        first_seen: parse_datetime(&col_text(row, 1, op)?)?,
        last_heartbeat: parse_datetime(&col_text(row, 2, op)?)?,
        jobs_processed: to_u64(col_int(row, 3, op)?),
        jobs_failed: to_u64(col_int(row, 4, op)?),
        cpu_usage: row.get(5).ok(),
        memory_usage: row.get(6).ok(),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn row_to_history_point(row: &Row) -> Result<WorkerHistoryPoint, DatabaseError> {
    let op = "row_to_history_point";
    let day: String = col_text(row, 0, op)?;
    Ok(WorkerHistoryPoint {
        day: NaiveDate::parse_from_str(&day, "%Y-%m-%d")
            .map_err(|e| DatabaseError::Serialization(format!("bad day {day:?}: {e}")))?,
        active_count: to_u32(col_int(row, 1, op)?),
        inactive_count: to_u32(col_int(row, 2, op)?),
        failed_count: to_u32(col_int(row, 3, op)?),
    })
}

fn row_to_quota(row: &Row) -> Result<OrganizationQuota, DatabaseError> {
    let op = "row_to_quota";
    Ok(OrganizationQuota {
        organization_id: col_text(row, 0, op)?,
        limit: to_u64(col_int(row, 1, op)?),
        current_usage: to_u64(col_int(row, 2, op)?),
        updated_at: parse_datetime(&col_text(row, 3, op)?)?,
    })
}

const REQUEST_COLUMNS: &str = "id, organization_id, requested_by, request_type, current_limit, requested_limit, reason, status, created_at, reviewed_by, reviewed_at";

fn row_to_request(row: &Row) -> Result<QuotaRequest, DatabaseError> {
    let op = "row_to_request";
    Ok(QuotaRequest {
        id: parse_uuid(&col_text(row, 0, op)?)?,
        organization_id: col_text(row, 1, op)?,
        requested_by: col_text(row, 2, op)?,
        request_type: col_text(row, 3, op)?,
        current_limit: to_u64(col_int(row, 4, op)?),
        requested_limit: to_u64(col_int(row, 5, op)?),
        reason: col_text(row, 6, op)?,
        status: parse_enum(&col_text(row, 7, op)?)?,
        created_at: parse_datetime(&col_text(row, 8, op)?)?,
        reviewed_by: row.get(9).ok(),
        reviewed_at: parse_optional_datetime(row.get(10).ok())?,
    })
}

const JOB_COLUMNS: &str =
    "id, organization_id, cost, status, submitted_at, completed_at, latency_ms";

fn row_to_job(row: &Row) -> Result<JobRecord, DatabaseError> {
    let op = "row_to_job";
    Ok(JobRecord {
        id: parse_uuid(&col_text(row, 0, op)?)?,
        organization_id: col_text(row, 1, op)?,
        cost: to_u64(col_int(row, 2, op)?),
        status: parse_enum(&col_text(row, 3, op)?)?,
        submitted_at: parse_datetime(&col_text(row, 4, op)?)?,
        completed_at: parse_optional_datetime(row.get(5).ok())?,
        latency_ms: row.get(6).ok(),
    })
}

const EVENT_COLUMNS: &str = "id, action, requested, worker_ids, target, active, queue_depth, succeeded, error, created_at";

fn row_to_event(row: &Row) -> Result<ScalingEvent, DatabaseError> {
    let op = "row_to_event";
    let worker_ids: String = col_text(row, 3, op)?;
    Ok(ScalingEvent {
        id: parse_uuid(&col_text(row, 0, op)?)?,
        action: parse_enum(&col_text(row, 1, op)?)?,
        requested: to_u32(col_int(row, 2, op)?),
        worker_ids: serde_json::from_str(&worker_ids)
            .map_err(|e| DatabaseError::Serialization(format!("worker_ids: {e}")))?,
        target: to_u32(col_int(row, 4, op)?),
        active: to_u32(col_int(row, 5, op)?),
        queue_depth: to_u64(col_int(row, 6, op)?),
        succeeded: col_int(row, 7, op)? != 0,
        error: row.get(8).ok(),
        created_at: parse_datetime(&col_text(row, 9, op)?)?,
    })
}

fn row_to_snapshot(row: &Row) -> Result<PoolSnapshot, DatabaseError> {
    let op = "row_to_snapshot";
    Ok(PoolSnapshot {
        recorded_at: parse_datetime(&col_text(row, 0, op)?)?,
        active: to_u32(col_int(row, 1, op)?),
        idle: to_u32(col_int(row, 2, op)?),
        total: to_u32(col_int(row, 3, op)?),
        max: to_u32(col_int(row, 4, op)?),
    })
}

fn row_to_alert_run(row: &Row) -> Result<AlertRun, DatabaseError> {
    let op = "row_to_alert_run";
    let details: String = col_text(row, 5, op)?;
    Ok(AlertRun {
        dedup_key: col_text(row, 0, op)?,
        window_start: parse_datetime(&col_text(row, 2, op)?)?,
        result: CheckResult {
            kind: parse_enum(&col_text(row, 1, op)?)?,
            status: parse_enum(&col_text(row, 3, op)?)?,
            message: col_text(row, 4, op)?,
            details: serde_json::from_str(&details)
                .map_err(|e| DatabaseError::Serialization(format!("details: {e}")))?,
        },
        created_at: parse_datetime(&col_text(row, 6, op)?)?,
    })
}

fn row_to_audit(row: &Row) -> Result<AuditEntry, DatabaseError> {
    let op = "row_to_audit";
    Ok(AuditEntry {
        id: parse_uuid(&col_text(row, 0, op)?)?,
        dedup_key: col_text(row, 1, op)?,
        kind: parse_enum(&col_text(row, 2, op)?)?,
        status: parse_enum(&col_text(row, 3, op)?)?,
        replayed: col_int(row, 4, op)? != 0,
        message: col_text(row, 5, op)?,
        recorded_at: parse_datetime(&col_text(row, 6, op)?)?,
    })
}

/// Body of the review transaction; the caller owns BEGIN/COMMIT.
async fn review_in_tx(
    conn: &Connection,
    id: Uuid,
    reviewer: &str,
    decision: ReviewDecision,
    at: DateTime<Utc>,
) -> Result<ReviewWrite, DatabaseError> {
    let op = "review_quota_request";
    let existing = query_one(
        conn,
        op,
        &format!("SELECT {REQUEST_COLUMNS} FROM quota_requests WHERE id = ?1"),
        params![id.to_string()],
        row_to_request,
    )
    .await?;

    let Some(mut request) = existing else {
        return Ok(ReviewWrite::NotFound);
    };
    if request.status != RequestStatus::Pending {
        return Ok(ReviewWrite::NotPending(request));
    }

    if decision == ReviewDecision::Approve {
        let current_limit = query_one(
            conn,
            op,
            "SELECT limit_value FROM org_quotas WHERE organization_id = ?1",
            params![request.organization_id.clone()],
            |row| col_int(row, 0, "review_quota_request"),
        )
        .await?
        .map(to_u64)
        .unwrap_or(0);
        // Approval may only raise the limit; an older, smaller request is stale.
        if request.requested_limit <= current_limit {
            return Ok(ReviewWrite::Superseded {
                request,
                current_limit,
            });
        }
    }

    let status = decision.resulting_status();
    let at_str = fmt_ts(at);
    conn.execute(
        "UPDATE quota_requests SET status = ?1, reviewed_by = ?2, reviewed_at = ?3 WHERE id = ?4 AND status = 'pending'",
        params![status.to_string(), reviewer, at_str.clone(), id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("{op} update request: {e}")))?;

    if decision == ReviewDecision::Approve {
        conn.execute(
            "UPDATE org_quotas SET limit_value = ?1, updated_at = ?2 WHERE organization_id = ?3",
            params![
                to_i64(request.requested_limit),
                at_str,
                request.organization_id.clone()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} update limit: {e}")))?;
    }

    request.status = status;
    request.reviewed_by = Some(reviewer.to_string());
    request.reviewed_at = Some(at);
    Ok(ReviewWrite::Applied(request))
}

/// Body of the admission transaction; the caller owns BEGIN/COMMIT.
async fn admit_in_tx(
    conn: &Connection,
    job: &JobRecord,
    expected_usage: u64,
) -> Result<bool, DatabaseError> {
    let op = "try_admit_job";
    let new_usage = expected_usage.saturating_add(job.cost);
    let changed = conn
        .execute(
            "UPDATE org_quotas SET current_usage = ?1, updated_at = ?2 WHERE organization_id = ?3 AND current_usage = ?4 AND limit_value >= ?1",
            params![
                to_i64(new_usage),
                fmt_ts(job.submitted_at),
                job.organization_id.clone(),
                to_i64(expected_usage)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} usage: {e}")))?;

    if changed == 0 {
        return Ok(false);
    }

    insert_job_row(conn, job).await?;
    Ok(true)
}

async fn insert_job_row(conn: &Connection, job: &JobRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, organization_id, cost, status, submitted_at, completed_at, latency_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            job.id.to_string(),
            job.organization_id.clone(),
            to_i64(job.cost),
            job.status.to_string(),
            fmt_ts(job.submitted_at),
            opt_text(job.completed_at.map(fmt_ts).as_deref()),
            opt_int(job.latency_ms),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;
    Ok(())
}

/// Body of the archive transaction; the caller owns BEGIN/COMMIT.
async fn archive_in_tx(
    conn: &Connection,
    cutoff: &str,
    archived_at: &str,
) -> Result<usize, DatabaseError> {
    let op = "archive_workers";
    conn.execute(
        &format!(
            "INSERT INTO worker_archive ({WORKER_COLUMNS}, archived_at) SELECT {WORKER_COLUMNS}, ?2 FROM workers WHERE last_heartbeat < ?1"
        ),
        params![cutoff, archived_at],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("{op} copy: {e}")))?;

    let removed = conn
        .execute(
            "DELETE FROM workers WHERE last_heartbeat < ?1",
            params![cutoff],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} delete: {e}")))?;
    Ok(removed as usize)
}

#[async_trait]
impl FleetStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn upsert_heartbeat(&self, hb: &HeartbeatWrite) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workers (worker_id, first_seen, last_heartbeat, jobs_processed, jobs_failed, cpu_usage, memory_usage, metadata)
             VALUES (?1, ?2, ?2, COALESCE(?3, 0), COALESCE(?4, 0), ?5, ?6, ?7)
             ON CONFLICT(worker_id) DO UPDATE SET
                last_heartbeat = excluded.last_heartbeat,
                jobs_processed = MAX(workers.jobs_processed, excluded.jobs_processed),
                jobs_failed = MAX(workers.jobs_failed, excluded.jobs_failed),
                cpu_usage = COALESCE(excluded.cpu_usage, workers.cpu_usage),
                memory_usage = COALESCE(excluded.memory_usage, workers.memory_usage),
                metadata = COALESCE(excluded.metadata, workers.metadata)",
            params![
                hb.worker_id.clone(),
                fmt_ts(hb.received_at),
                opt_int(hb.jobs_processed.map(to_i64)),
                opt_int(hb.jobs_failed.map(to_i64)),
                opt_real(hb.cpu_usage),
                opt_real(hb.memory_usage),
                opt_json(hb.metadata.as_ref())?,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_heartbeat: {e}")))?;

        debug!(worker_id = %hb.worker_id, "Heartbeat upserted");
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_one(
            &conn,
            "get_worker",
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1"),
            params![worker_id],
            row_to_worker,
        )
        .await
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_all(
            &conn,
            "list_workers",
            &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY worker_id"),
            (),
            row_to_worker,
        )
        .await
    }

    async fn archive_workers(
        &self,
        cutoff: DateTime<Utc>,
        archived_at: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().await;
        begin_immediate(&conn, "archive_workers").await?;
        let result = archive_in_tx(&conn, &fmt_ts(cutoff), &fmt_ts(archived_at)).await;
        let count = finish_tx(&conn, "archive_workers", result).await?;

        if count > 0 {
            info!(count, cutoff = %cutoff, "Archived stale workers");
        }
        Ok(count)
    }

    async fn upsert_history_point(&self, point: &WorkerHistoryPoint) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO worker_history (day, active_count, inactive_count, failed_count) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(day) DO UPDATE SET
                active_count = excluded.active_count,
                inactive_count = excluded.inactive_count,
                failed_count = excluded.failed_count",
            params![
                point.day.format("%Y-%m-%d").to_string(),
                i64::from(point.active_count),
                i64::from(point.inactive_count),
                i64::from(point.failed_count),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_history_point: {e}")))?;
        Ok(())
    }

    async fn list_history(&self, limit: u32) -> Result<Vec<WorkerHistoryPoint>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut points = query_all(
            &conn,
            "list_history",
            "SELECT day, active_count, inactive_count, failed_count FROM worker_history ORDER BY day DESC LIMIT ?1",
            params![i64::from(limit)],
            row_to_history_point,
        )
        .await?;
        points.reverse();
        Ok(points)
    }

    // ── Leases ──────────────────────────────────────────────────────

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT INTO leases (key, holder, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE leases.expires_at_ms <= ?4",
                params![key, holder, now_ms.saturating_add(ttl_ms), now_ms],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lease: {e}")))?;
        Ok(changed == 1)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM leases WHERE key = ?1 AND holder = ?2",
                params![key, holder],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lease: {e}")))?;
        Ok(changed == 1)
    }

    // ── Quotas ──────────────────────────────────────────────────────

    async fn ensure_organization(
        &self,
        organization_id: &str,
        default_limit: u64,
        now: DateTime<Utc>,
    ) -> Result<OrganizationQuota, DatabaseError> {
        let conn = self.conn.lock().await;
        let created = conn
            .execute(
                "INSERT OR IGNORE INTO org_quotas (organization_id, limit_value, current_usage, updated_at) VALUES (?1, ?2, 0, ?3)",
                params![organization_id, to_i64(default_limit), fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_organization: {e}")))?;
        if created > 0 {
            info!(organization_id, limit = default_limit, "Organization quota provisioned");
        }

        query_one(
            &conn,
            "ensure_organization",
            "SELECT organization_id, limit_value, current_usage, updated_at FROM org_quotas WHERE organization_id = ?1",
            params![organization_id],
            row_to_quota,
        )
        .await?
        .ok_or_else(|| DatabaseError::Query(format!("organization {organization_id} vanished")))
    }

    async fn get_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationQuota>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_one(
            &conn,
            "get_organization",
            "SELECT organization_id, limit_value, current_usage, updated_at FROM org_quotas WHERE organization_id = ?1",
            params![organization_id],
            row_to_quota,
        )
        .await
    }

    async fn try_admit_job(
        &self,
        job: &JobRecord,
        expected_usage: u64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        begin_immediate(&conn, "try_admit_job").await?;
        let result = admit_in_tx(&conn, job, expected_usage).await;
        finish_tx(&conn, "try_admit_job", result).await
    }

    async fn insert_quota_request(&self, request: &QuotaRequest) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO quota_requests ({REQUEST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                request.id.to_string(),
                request.organization_id.clone(),
                request.requested_by.clone(),
                request.request_type.clone(),
                to_i64(request.current_limit),
                to_i64(request.requested_limit),
                request.reason.clone(),
                request.status.to_string(),
                fmt_ts(request.created_at),
                opt_text(request.reviewed_by.as_deref()),
                opt_text(request.reviewed_at.map(fmt_ts).as_deref()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_quota_request: {e}")))?;

        debug!(request_id = %request.id, organization_id = %request.organization_id, "Quota request stored");
        Ok(())
    }

    async fn get_quota_request(&self, id: Uuid) -> Result<Option<QuotaRequest>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_one(
            &conn,
            "get_quota_request",
            &format!("SELECT {REQUEST_COLUMNS} FROM quota_requests WHERE id = ?1"),
            params![id.to_string()],
            row_to_request,
        )
        .await
    }

    async fn list_quota_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<QuotaRequest>, DatabaseError> {
        let conn = self.conn.lock().await;
        match status {
            Some(status) => {
                query_all(
                    &conn,
                    "list_quota_requests",
                    &format!(
                        "SELECT {REQUEST_COLUMNS} FROM quota_requests WHERE status = ?1 ORDER BY created_at DESC"
                    ),
                    params![status.to_string()],
                    row_to_request,
                )
                .await
            }
            None => {
                query_all(
                    &conn,
                    "list_quota_requests",
                    &format!("SELECT {REQUEST_COLUMNS} FROM quota_requests ORDER BY created_at DESC"),
                    (),
                    row_to_request,
                )
                .await
            }
        }
    }

    async fn review_quota_request(
        &self,
        id: Uuid,
        reviewer: &str,
        decision: ReviewDecision,
        at: DateTime<Utc>,
    ) -> Result<ReviewWrite, DatabaseError> {
        let conn = self.conn.lock().await;
        begin_immediate(&conn, "review_quota_request").await?;
        let result = review_in_tx(&conn, id, reviewer, decision, at).await;
        finish_tx(&conn, "review_quota_request", result).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &JobRecord) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        insert_job_row(&conn, job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_one(
            &conn,
            "get_job",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.to_string()],
            row_to_job,
        )
        .await
    }

    async fn complete_job(
        &self,
        id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let job = query_one(
            &conn,
            "complete_job",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.to_string()],
            row_to_job,
        )
        .await?;

        let Some(job) = job else {
            return Ok(false);
        };
        if job.status != JobStatus::Queued {
            return Ok(false);
        }

        let latency_ms = (at - job.submitted_at).num_milliseconds().max(0);
        let changed = conn
            .execute(
                "UPDATE jobs SET status = ?1, completed_at = ?2, latency_ms = ?3 WHERE id = ?4 AND status = 'queued'",
                params![status.to_string(), fmt_ts(at), latency_ms, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;
        Ok(changed == 1)
    }

    async fn count_jobs(&self, status: JobStatus) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        let count = query_one(
            &conn,
            "count_jobs",
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.to_string()],
            |row| col_int(row, 0, "count_jobs"),
        )
        .await?;
        Ok(to_u64(count.unwrap_or(0)))
    }

    async fn job_outcomes_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<JobOutcomeSummary, DatabaseError> {
        let conn = self.conn.lock().await;
        let summary = query_one(
            &conn,
            "job_outcomes_since",
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    CAST(COALESCE(AVG(latency_ms), 0) AS REAL)
             FROM jobs
             WHERE completed_at IS NOT NULL AND completed_at >= ?1",
            params![fmt_ts(since)],
            |row| {
                let op = "job_outcomes_since";
                Ok(JobOutcomeSummary {
                    total: to_u64(col_int(row, 0, op)?),
                    failed: to_u64(col_int(row, 1, op)?),
                    avg_latency_ms: col_real(row, 2, op)?,
                })
            },
        )
        .await?;
        Ok(summary.unwrap_or_default())
    }

    // ── Scaling ─────────────────────────────────────────────────────

    async fn insert_scaling_event(&self, event: &ScalingEvent) -> Result<(), DatabaseError> {
        let worker_ids = serde_json::to_string(&event.worker_ids)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO scaling_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                event.id.to_string(),
                event.action.to_string(),
                i64::from(event.requested),
                worker_ids,
                i64::from(event.target),
                i64::from(event.active),
                to_i64(event.queue_depth),
                i64::from(event.succeeded),
                opt_text(event.error.as_deref()),
                fmt_ts(event.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_scaling_event: {e}")))?;
        Ok(())
    }

    async fn last_successful_scaling_event(&self) -> Result<Option<ScalingEvent>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_one(
            &conn,
            "last_successful_scaling_event",
            &format!(
                "SELECT {EVENT_COLUMNS} FROM scaling_events WHERE succeeded = 1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            (),
            row_to_event,
        )
        .await
    }

    async fn list_scaling_events(&self, limit: u32) -> Result<Vec<ScalingEvent>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_all(
            &conn,
            "list_scaling_events",
            &format!("SELECT {EVENT_COLUMNS} FROM scaling_events ORDER BY created_at DESC, rowid DESC LIMIT ?1"),
            params![i64::from(limit)],
            row_to_event,
        )
        .await
    }

    // ── Connection pool ─────────────────────────────────────────────

    async fn insert_pool_snapshot(&self, snapshot: &PoolSnapshot) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pool_snapshots (recorded_at, active, idle, total, max_size) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fmt_ts(snapshot.recorded_at),
                i64::from(snapshot.active),
                i64::from(snapshot.idle),
                i64::from(snapshot.total),
                i64::from(snapshot.max),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_pool_snapshot: {e}")))?;
        Ok(())
    }

    async fn latest_pool_snapshot(&self) -> Result<Option<PoolSnapshot>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_one(
            &conn,
            "latest_pool_snapshot",
            "SELECT recorded_at, active, idle, total, max_size FROM pool_snapshots ORDER BY recorded_at DESC, rowid DESC LIMIT 1",
            (),
            row_to_snapshot,
        )
        .await
    }

    async fn list_pool_snapshots(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PoolSnapshot>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_all(
            &conn,
            "list_pool_snapshots",
            "SELECT recorded_at, active, idle, total, max_size FROM pool_snapshots WHERE recorded_at >= ?1 ORDER BY recorded_at, rowid",
            params![fmt_ts(since)],
            row_to_snapshot,
        )
        .await
    }

    // ── Alerts ──────────────────────────────────────────────────────

    async fn get_alert_run(&self, dedup_key: &str) -> Result<Option<AlertRun>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_one(
            &conn,
            "get_alert_run",
            "SELECT dedup_key, check_kind, window_start, status, message, details, created_at FROM alert_runs WHERE dedup_key = ?1",
            params![dedup_key],
            row_to_alert_run,
        )
        .await
    }

    async fn insert_alert_run(&self, run: &AlertRun) -> Result<bool, DatabaseError> {
        let details = serde_json::to_string(&run.result.details)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO alert_runs (dedup_key, check_kind, window_start, status, message, details, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.dedup_key.clone(),
                    run.result.kind.to_string(),
                    fmt_ts(run.window_start),
                    run.result.status.to_string(),
                    run.result.message.clone(),
                    details,
                    fmt_ts(run.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_alert_run: {e}")))?;
        Ok(inserted == 1)
    }

    async fn append_alert_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO alert_audit (id, dedup_key, check_kind, status, replayed, message, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id.to_string(),
                entry.dedup_key.clone(),
                entry.kind.to_string(),
                entry.status.to_string(),
                i64::from(entry.replayed),
                entry.message.clone(),
                fmt_ts(entry.recorded_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_alert_audit: {e}")))?;
        Ok(())
    }

    async fn list_alert_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_all(
            &conn,
            "list_alert_audit",
            "SELECT id, dedup_key, check_kind, status, replayed, message, recorded_at FROM alert_audit ORDER BY recorded_at DESC, rowid DESC LIMIT ?1",
            params![i64::from(limit)],
            row_to_audit,
        )
        .await
    }
}

//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version in `_migrations` and applies only the newer ones, in
//! order.
//!
//! Timestamps are stored as fixed-width RFC 3339 text (millisecond precision,
//! `Z` suffix) so range filters can compare them as strings. Lease expiry is
//! integer Unix milliseconds.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "worker_registry",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                first_seen TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                jobs_processed INTEGER NOT NULL DEFAULT 0,
                jobs_failed INTEGER NOT NULL DEFAULT 0,
                cpu_usage REAL,
                memory_usage REAL,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_workers_last_heartbeat ON workers(last_heartbeat);

            CREATE TABLE IF NOT EXISTS worker_archive (
                worker_id TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                jobs_processed INTEGER NOT NULL,
                jobs_failed INTEGER NOT NULL,
                cpu_usage REAL,
                memory_usage REAL,
                metadata TEXT,
                archived_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_worker_archive_worker ON worker_archive(worker_id);

            CREATE TABLE IF NOT EXISTS worker_history (
                day TEXT PRIMARY KEY,
                active_count INTEGER NOT NULL,
                inactive_count INTEGER NOT NULL,
                failed_count INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "coordination_leases",
        sql: r#"
            CREATE TABLE IF NOT EXISTS leases (
                key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "quotas_and_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS org_quotas (
                organization_id TEXT PRIMARY KEY,
                limit_value INTEGER NOT NULL,
                current_usage INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS quota_requests (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                request_type TEXT NOT NULL,
                current_limit INTEGER NOT NULL,
                requested_limit INTEGER NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                reviewed_by TEXT,
                reviewed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_quota_requests_status ON quota_requests(status);
            CREATE INDEX IF NOT EXISTS idx_quota_requests_org ON quota_requests(organization_id);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                cost INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                submitted_at TEXT NOT NULL,
                completed_at TEXT,
                latency_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_completed_at ON jobs(completed_at);
        "#,
    },
    Migration {
        version: 4,
        name: "scaling_and_pool",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scaling_events (
                id TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                requested INTEGER NOT NULL,
                worker_ids TEXT NOT NULL DEFAULT '[]',
                target INTEGER NOT NULL,
                active INTEGER NOT NULL,
                queue_depth INTEGER NOT NULL,
                succeeded INTEGER NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scaling_events_created ON scaling_events(created_at);

            CREATE TABLE IF NOT EXISTS pool_snapshots (
                recorded_at TEXT NOT NULL,
                active INTEGER NOT NULL,
                idle INTEGER NOT NULL,
                total INTEGER NOT NULL,
                max_size INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pool_snapshots_recorded ON pool_snapshots(recorded_at);
        "#,
    },
    Migration {
        version: 5,
        name: "alerting",
        sql: r#"
            CREATE TABLE IF NOT EXISTS alert_runs (
                dedup_key TEXT PRIMARY KEY,
                check_kind TEXT NOT NULL,
                window_start TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alert_audit (
                id TEXT PRIMARY KEY,
                dedup_key TEXT NOT NULL,
                check_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                replayed INTEGER NOT NULL,
                message TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alert_audit_recorded ON alert_audit(recorded_at);
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

//! Worker registry service.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::model::{
    HeartbeatReport, HeartbeatWrite, StalenessThresholds, WorkerDetail, WorkerHistoryPoint,
    WorkerRecord, WorkerStats, WorkerStatus,
};
use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::error::{FleetError, Result};
use crate::store::FleetStore;

/// Longest accepted worker id, in bytes.
pub const MAX_WORKER_ID_LEN: usize = 256;

/// Keep the INACTIVE entries of `workers`, stalest heartbeat first.
pub fn stalest_inactive(workers: Vec<WorkerDetail>) -> Vec<WorkerDetail> {
    let mut inactive: Vec<WorkerDetail> = workers
        .into_iter()
        .filter(|w| w.status == WorkerStatus::Inactive)
        .collect();
    inactive.sort_by_key(|w| w.record.last_heartbeat);
    inactive
}

/// Heartbeat ingest and health queries. Status is computed on read from the
/// heartbeat age; nothing expires workers in the background.
pub struct WorkerRegistry {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn FleetStore>, clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn thresholds(&self) -> StalenessThresholds {
        self.config.thresholds()
    }

    /// Apply a heartbeat and return the accepted worker id.
    pub async fn record_heartbeat(&self, report: HeartbeatReport) -> Result<String> {
        let worker_id = report.worker_id.trim();
        if worker_id.is_empty() {
            return Err(FleetError::validation("worker_id is required"));
        }
        if worker_id.len() > MAX_WORKER_ID_LEN {
            return Err(FleetError::validation(format!(
                "worker_id exceeds {MAX_WORKER_ID_LEN} bytes"
            )));
        }
        check_gauge("cpu_usage", report.cpu_usage)?;
        check_gauge("memory_usage", report.memory_usage)?;

        let write = HeartbeatWrite {
            worker_id: worker_id.to_string(),
            received_at: self.clock.now(),
            jobs_processed: report.jobs_processed,
            jobs_failed: report.jobs_failed,
            cpu_usage: report.cpu_usage,
            memory_usage: report.memory_usage,
            metadata: report.metadata,
        };
        self.store.upsert_heartbeat(&write).await?;

        debug!(
            worker_id = %write.worker_id,
            jobs_processed = ?write.jobs_processed,
            jobs_failed = ?write.jobs_failed,
            "Heartbeat accepted"
        );
        Ok(write.worker_id)
    }

    /// Counts by status as of now.
    pub async fn stats(&self) -> Result<WorkerStats> {
        let now = self.clock.now();
        let thresholds = self.thresholds();
        let mut stats = WorkerStats {
            computed_at: Some(now),
            ..Default::default()
        };
        for worker in self.store.list_workers().await? {
            stats.count(thresholds.status_at(worker.last_heartbeat, now));
        }
        Ok(stats)
    }

    /// Every live worker with its derived status, ordered by id.
    pub async fn details(&self) -> Result<Vec<WorkerDetail>> {
        let now = self.clock.now();
        let thresholds = self.thresholds();
        Ok(self
            .store
            .list_workers()
            .await?
            .into_iter()
            .map(|record| detail(record, thresholds, now))
            .collect())
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<WorkerDetail> {
        let record = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| FleetError::NotFound {
                entity: "worker",
                id: worker_id.to_string(),
            })?;
        Ok(detail(record, self.thresholds(), self.clock.now()))
    }

    /// INACTIVE workers, stalest heartbeat first.
    pub async fn inactive_workers(&self) -> Result<Vec<WorkerDetail>> {
        Ok(stalest_inactive(self.details().await?))
    }

    /// The last `days` daily points, oldest first.
    pub async fn history(&self, days: u32) -> Result<Vec<WorkerHistoryPoint>> {
        if !(1..=365).contains(&days) {
            return Err(FleetError::validation("days must be between 1 and 365"));
        }
        Ok(self.store.list_history(days).await?)
    }

    /// Write (or refresh) today's history point from the current stats.
    pub async fn record_daily_snapshot(&self) -> Result<WorkerHistoryPoint> {
        let stats = self.stats().await?;
        let point = WorkerHistoryPoint {
            day: self.clock.now().date_naive(),
            active_count: stats.active,
            inactive_count: stats.inactive,
            failed_count: stats.failed,
        };
        self.store.upsert_history_point(&point).await?;
        debug!(day = %point.day, active = point.active_count, "History point recorded");
        Ok(point)
    }

    /// Move workers silent for longer than `retention` to the archive.
    pub async fn archive_stale(&self, retention: Duration) -> Result<usize> {
        if retention < self.config.failed_threshold {
            return Err(FleetError::validation(
                "retention must be at least the FAILED threshold",
            ));
        }
        let now = self.clock.now();
        let retention = chrono::Duration::from_std(retention)
            .map_err(|_| FleetError::validation("retention out of range"))?;
        let archived = self.store.archive_workers(now - retention, now).await?;
        if archived > 0 {
            info!(archived, "Stale workers archived");
        }
        Ok(archived)
    }

    /// Archive with the configured retention.
    pub async fn archive_expired(&self) -> Result<usize> {
        self.archive_stale(self.config.archive_after).await
    }
}

fn check_gauge(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(FleetError::validation(format!(
            "{name} must be a finite, non-negative number"
        ))),
        _ => Ok(()),
    }
}

fn detail(
    record: WorkerRecord,
    thresholds: StalenessThresholds,
    now: chrono::DateTime<chrono::Utc>,
) -> WorkerDetail {
    let status = thresholds.status_at(record.last_heartbeat, now);
    let uptime_ms = (now - record.first_seen).num_milliseconds().max(0);
    WorkerDetail {
        record,
        status,
        uptime_hours: uptime_ms as f64 / 3_600_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LibSqlBackend;
    use chrono::{TimeZone, Utc};

    fn config() -> RegistryConfig {
        RegistryConfig {
            active_threshold: Duration::from_secs(120),
            failed_threshold: Duration::from_secs(600),
            archive_after: Duration::from_secs(30 * 24 * 3600),
            snapshot_interval: Duration::from_secs(3600),
        }
    }

    async fn setup() -> (WorkerRegistry, Arc<ManualClock>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap(),
        ));
        (WorkerRegistry::new(store, clock.clone(), config()), clock)
    }

    #[tokio::test]
    async fn status_follows_heartbeat_age() {
        let (registry, clock) = setup().await;
        registry
            .record_heartbeat(HeartbeatReport::new("w1"))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(90));
        assert_eq!(registry.get_worker("w1").await.unwrap().status, WorkerStatus::Active);

        clock.advance(Duration::from_secs(60));
        assert_eq!(registry.get_worker("w1").await.unwrap().status, WorkerStatus::Inactive);

        clock.advance(Duration::from_secs(500));
        assert_eq!(registry.get_worker("w1").await.unwrap().status, WorkerStatus::Failed);
    }

    #[tokio::test]
    async fn lower_counter_never_regresses() {
        let (registry, _clock) = setup().await;
        registry
            .record_heartbeat(HeartbeatReport::new("w1").with_counters(50, 2))
            .await
            .unwrap();
        registry
            .record_heartbeat(HeartbeatReport::new("w1").with_counters(10, 5))
            .await
            .unwrap();

        let w = registry.get_worker("w1").await.unwrap();
        assert_eq!(w.record.jobs_processed, 50);
        assert_eq!(w.record.jobs_failed, 5);
    }

    #[tokio::test]
    async fn rejects_bad_heartbeats() {
        let (registry, _clock) = setup().await;
        for report in [
            HeartbeatReport::new(""),
            HeartbeatReport::new("   "),
            HeartbeatReport::new("x".repeat(MAX_WORKER_ID_LEN + 1)),
            HeartbeatReport::new("w1").with_gauges(-0.1, 0.5),
            HeartbeatReport::new("w1").with_gauges(0.5, f64::NAN),
        ] {
            let err = registry.record_heartbeat(report).await.unwrap_err();
            assert!(matches!(err, FleetError::Validation(_)), "got {err:?}");
        }
        assert!(registry.details().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn worker_id_is_trimmed() {
        let (registry, _clock) = setup().await;
        let id = registry
            .record_heartbeat(HeartbeatReport::new("  w1  "))
            .await
            .unwrap();
        assert_eq!(id, "w1");
        assert!(registry.get_worker("w1").await.is_ok());
    }

    #[tokio::test]
    async fn stats_group_by_status() {
        let (registry, clock) = setup().await;
        registry.record_heartbeat(HeartbeatReport::new("old")).await.unwrap();
        clock.advance(Duration::from_secs(700));
        registry.record_heartbeat(HeartbeatReport::new("mid")).await.unwrap();
        clock.advance(Duration::from_secs(200));
        registry.record_heartbeat(HeartbeatReport::new("new")).await.unwrap();

        let stats = registry.stats().await.unwrap();
        assert_eq!((stats.active, stats.inactive, stats.failed, stats.total), (1, 1, 1, 3));
        assert_eq!(stats.computed_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn uptime_counts_from_first_seen() {
        let (registry, clock) = setup().await;
        registry.record_heartbeat(HeartbeatReport::new("w1")).await.unwrap();
        clock.advance(Duration::from_secs(2 * 3600));
        registry.record_heartbeat(HeartbeatReport::new("w1")).await.unwrap();

        let w = registry.get_worker("w1").await.unwrap();
        assert!((w.uptime_hours - 2.0).abs() < 1e-9);
        assert_eq!(w.status, WorkerStatus::Active);
    }

    #[tokio::test]
    async fn unknown_worker_is_not_found() {
        let (registry, _clock) = setup().await;
        let err = registry.get_worker("ghost").await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound { entity: "worker", .. }));
    }

    #[tokio::test]
    async fn inactive_workers_stalest_first() {
        let (registry, clock) = setup().await;
        registry.record_heartbeat(HeartbeatReport::new("b")).await.unwrap();
        clock.advance(Duration::from_secs(30));
        registry.record_heartbeat(HeartbeatReport::new("a")).await.unwrap();
        clock.advance(Duration::from_secs(200));
        registry.record_heartbeat(HeartbeatReport::new("c")).await.unwrap();

        let ids: Vec<String> = registry
            .inactive_workers()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.record.worker_id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn daily_snapshot_refreshes_today() {
        let (registry, clock) = setup().await;
        registry.record_heartbeat(HeartbeatReport::new("w1")).await.unwrap();
        registry.record_daily_snapshot().await.unwrap();

        registry.record_heartbeat(HeartbeatReport::new("w2")).await.unwrap();
        registry.record_daily_snapshot().await.unwrap();

        clock.advance(Duration::from_secs(24 * 3600));
        registry.record_daily_snapshot().await.unwrap();

        let history = registry.history(7).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].active_count, 2);
        assert_eq!(history[1].failed_count, 2);
    }

    #[tokio::test]
    async fn history_days_are_bounded() {
        let (registry, _clock) = setup().await;
        assert!(registry.history(0).await.is_err());
        assert!(registry.history(366).await.is_err());
        assert!(registry.history(365).await.is_ok());
    }

    #[tokio::test]
    async fn archive_requires_retention_past_failed() {
        let (registry, clock) = setup().await;
        registry.record_heartbeat(HeartbeatReport::new("w1")).await.unwrap();
        clock.advance(Duration::from_secs(3600));

        assert!(registry.archive_stale(Duration::from_secs(60)).await.is_err());
        assert_eq!(registry.archive_stale(Duration::from_secs(600)).await.unwrap(), 1);
        assert!(registry.details().await.unwrap().is_empty());
    }
}

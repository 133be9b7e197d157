//! In-process periodic drivers.
//!
//! Each loop only calls a public service operation; any state lives in the
//! store, so aborting a handle just means the next run never happens. The HTTP
//! trigger endpoints remain available for an external scheduler.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::alerts::AlertEngine;
use crate::autoscale::Autoscaler;
use crate::config::FleetConfig;
use crate::error::{ConfigError, FleetError};
use crate::fleet::Fleet;
use crate::pool::PoolManager;
use crate::registry::WorkerRegistry;

/// Start every loop. Returns the handles so the caller can abort them.
pub fn spawn_all(fleet: &Fleet, config: &FleetConfig) -> Result<Vec<JoinHandle<()>>, ConfigError> {
    let schedule = cron::Schedule::from_str(&config.alerts.schedule).map_err(|e| {
        ConfigError::InvalidValue {
            key: "FLEET_ALERT_SCHEDULE".to_string(),
            message: format!("invalid cron: {e}"),
        }
    })?;

    let handles = vec![
        spawn_autoscale_ticker(Arc::clone(&fleet.autoscaler), config.autoscale.tick_interval),
        spawn_alert_ticker(Arc::clone(&fleet.alerts), schedule),
        spawn_registry_maintenance(Arc::clone(&fleet.registry), config.registry.snapshot_interval),
        spawn_pool_sampler(Arc::clone(&fleet.pool), config.pool.snapshot_interval),
    ];
    info!(
        autoscale_secs = config.autoscale.tick_interval.as_secs(),
        alert_schedule = %config.alerts.schedule,
        "Scheduler started"
    );
    Ok(handles)
}

/// Spawn the autoscaler ticker.
pub fn spawn_autoscale_ticker(autoscaler: Arc<Autoscaler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match autoscaler.tick().await {
                Ok(report) => debug!(
                    target_workers = report.target,
                    executed = report.executed,
                    "Scheduled autoscale tick"
                ),
                Err(e) => log_failure("autoscale tick", &e),
            }
        }
    })
}

/// Spawn the alert loop, firing on each cron occurrence.
pub fn spawn_alert_ticker(engine: Arc<AlertEngine>, schedule: cron::Schedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(delay) = next_delay(&schedule, Utc::now()) else {
                error!("Alert schedule has no upcoming occurrences, stopping");
                return;
            };
            tokio::time::sleep(delay).await;

            match engine.run_scheduled_check().await {
                Ok(report) => debug!(alerting = report.alerting(), "Scheduled alert check"),
                Err(e) => log_failure("alert check", &e),
            }
        }
    })
}

/// Spawn the daily-history and archival loop.
pub fn spawn_registry_maintenance(
    registry: Arc<WorkerRegistry>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = registry.record_daily_snapshot().await {
                log_failure("history snapshot", &e);
            }
            if let Err(e) = registry.archive_expired().await {
                log_failure("worker archival", &e);
            }
        }
    })
}

/// Spawn the pool utilization sampler.
pub fn spawn_pool_sampler(pool: Arc<PoolManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = pool.record_snapshot().await {
                log_failure("pool snapshot", &e);
            }
        }
    })
}

/// Time from `now` until the schedule next fires.
fn next_delay(schedule: &cron::Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or_default())
}

fn log_failure(operation: &str, e: &FleetError) {
    if e.is_contention() {
        debug!(operation, "Skipped, another instance is running it");
    } else {
        error!(operation, error = %e, "Scheduled operation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::clock::SystemClock;
    use crate::config::RegistryConfig;
    use crate::store::{FleetStore, LibSqlBackend};

    #[test]
    fn next_delay_follows_cron() {
        let schedule = cron::Schedule::from_str("0 */5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 3, 30).unwrap();
        assert_eq!(next_delay(&schedule, now), Some(Duration::from_secs(90)));
    }

    #[test]
    fn next_delay_skips_current_instant() {
        let schedule = cron::Schedule::from_str("0 */5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 5, 0).unwrap();
        assert_eq!(next_delay(&schedule, now), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn maintenance_loop_records_history() {
        let store: Arc<dyn FleetStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = RegistryConfig {
            active_threshold: Duration::from_secs(120),
            failed_threshold: Duration::from_secs(600),
            archive_after: Duration::from_secs(86_400),
            snapshot_interval: Duration::from_millis(20),
        };
        let registry = Arc::new(WorkerRegistry::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            config,
        ));

        let handle = spawn_registry_maintenance(Arc::clone(&registry), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        assert_eq!(registry.history(7).await.unwrap().len(), 1);
    }
}

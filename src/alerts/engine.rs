//! Scheduled failure-rate and performance checks.
//!
//! Each sub-check is recorded once per window bucket under its dedup key.
//! Repeat invocations inside the same bucket replay the recorded result and
//! never notify twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    AlertRun, AuditEntry, CheckKind, CheckOutcome, CheckResult, CheckStatus, ScheduledCheckReport,
};
use super::notifier::AlertNotifier;
use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::error::{DatabaseError, FleetError, Result};
use crate::jobs::{JobOutcomeSummary, JobQueue};
use crate::store::FleetStore;

pub struct AlertEngine {
    store: Arc<dyn FleetStore>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn AlertNotifier>,
    clock: Arc<dyn Clock>,
    config: AlertConfig,
}

/// Start of the bucket of size `window` containing `now`.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let size = i64::try_from(window.as_secs()).unwrap_or(i64::MAX).max(1);
    let start = now.timestamp().div_euclid(size) * size;
    DateTime::from_timestamp(start, 0).unwrap_or(now)
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn FleetStore>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn AlertNotifier>,
        clock: Arc<dyn Clock>,
        config: AlertConfig,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            clock,
            config,
        }
    }

    /// Run both sub-checks for the current window.
    pub async fn run_scheduled_check(&self) -> Result<ScheduledCheckReport> {
        let now = self.clock.now();
        let start = window_start(now, self.config.window);
        let end = start + chrono::Duration::from_std(self.config.window).unwrap_or_default();

        // Both checks run even if the first fails.
        let failure_rate = self.run_check(CheckKind::FailureRate, start, now).await;
        let performance = self.run_check(CheckKind::Performance, start, now).await;

        let report = ScheduledCheckReport {
            window_start: start,
            window_end: end,
            failure_rate: failure_rate?,
            performance: performance?,
        };
        info!(
            window_start = %start,
            alerting = report.alerting(),
            replayed = report.failure_rate.replayed && report.performance.replayed,
            "Scheduled alert check complete"
        );
        Ok(report)
    }

    pub async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        Ok(self.store.list_alert_audit(limit.clamp(1, 500)).await?)
    }

    async fn run_check(
        &self,
        kind: CheckKind,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome> {
        let key = kind.dedup_key(start);

        if let Some(existing) = self.store.get_alert_run(&key).await? {
            return self.replay(existing).await;
        }

        let result = self.evaluate(kind, now).await?;
        let run = AlertRun {
            dedup_key: key.clone(),
            window_start: start,
            result,
            created_at: now,
        };

        if !self.store.insert_alert_run(&run).await? {
            // Another invocation recorded this window first.
            let existing = self.store.get_alert_run(&key).await?.ok_or_else(|| {
                FleetError::from(DatabaseError::Query(format!(
                    "alert run {key} missing after conflicting insert"
                )))
            })?;
            return self.replay(existing).await;
        }

        self.audit(&run, false).await?;
        if run.result.is_alert() {
            if let Err(e) = self.notifier.notify(&run).await {
                warn!(dedup_key = %key, error = %e, "Alert notification failed");
            }
        }
        debug!(dedup_key = %key, status = %run.result.status, "Alert check recorded");

        Ok(CheckOutcome {
            dedup_key: key,
            replayed: false,
            result: run.result,
        })
    }

    async fn replay(&self, run: AlertRun) -> Result<CheckOutcome> {
        self.audit(&run, true).await?;
        debug!(dedup_key = %run.dedup_key, "Alert check replayed");
        Ok(CheckOutcome {
            dedup_key: run.dedup_key,
            replayed: true,
            result: run.result,
        })
    }

    async fn audit(&self, run: &AlertRun, replayed: bool) -> Result<()> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            dedup_key: run.dedup_key.clone(),
            kind: run.result.kind,
            status: run.result.status,
            replayed,
            message: run.result.message.clone(),
            recorded_at: self.clock.now(),
        };
        Ok(self.store.append_alert_audit(&entry).await?)
    }

    async fn evaluate(&self, kind: CheckKind, now: DateTime<Utc>) -> Result<CheckResult> {
        let since = now - chrono::Duration::from_std(self.config.window).unwrap_or_default();
        let summary = self.store.job_outcomes_since(since).await?;
        match kind {
            CheckKind::FailureRate => Ok(self.failure_rate_check(&summary)),
            CheckKind::Performance => {
                let depth = self.queue.pending_depth().await?;
                Ok(self.performance_check(&summary, depth))
            }
        }
    }

    fn failure_rate_check(&self, summary: &JobOutcomeSummary) -> CheckResult {
        let rate = summary.failure_rate();
        let threshold = self.config.failure_rate_threshold;
        let details = serde_json::json!({
            "total": summary.total,
            "failed": summary.failed,
            "failure_rate": rate,
            "threshold": threshold,
            "min_jobs": self.config.min_jobs,
        });

        let (status, message) = if summary.total < self.config.min_jobs {
            (
                CheckStatus::Pass,
                format!(
                    "{} completed jobs in window, fewer than {} required",
                    summary.total, self.config.min_jobs
                ),
            )
        } else if rate > threshold {
            (
                CheckStatus::Alert,
                format!(
                    "job failure rate {:.1}% above {:.1}% ({} of {} failed)",
                    rate * 100.0,
                    threshold * 100.0,
                    summary.failed,
                    summary.total
                ),
            )
        } else {
            (
                CheckStatus::Pass,
                format!("job failure rate {:.1}% within threshold", rate * 100.0),
            )
        };

        CheckResult {
            kind: CheckKind::FailureRate,
            status,
            message,
            details,
        }
    }

    fn performance_check(&self, summary: &JobOutcomeSummary, queue_depth: u64) -> CheckResult {
        let latency_limit_ms = self.config.latency_threshold.as_millis() as f64;
        let depth_limit = self.config.queue_depth_threshold;
        let details = serde_json::json!({
            "completed": summary.total,
            "avg_latency_ms": summary.avg_latency_ms,
            "latency_threshold_ms": latency_limit_ms,
            "queue_depth": queue_depth,
            "queue_depth_threshold": depth_limit,
        });

        let mut breaches = Vec::new();
        if summary.total > 0 && summary.avg_latency_ms > latency_limit_ms {
            breaches.push(format!(
                "average latency {:.0}ms above {:.0}ms",
                summary.avg_latency_ms, latency_limit_ms
            ));
        }
        if queue_depth > depth_limit {
            breaches.push(format!("queue depth {queue_depth} above {depth_limit}"));
        }

        let (status, message) = if breaches.is_empty() {
            (
                CheckStatus::Pass,
                "latency and queue depth within thresholds".to_string(),
            )
        } else {
            (CheckStatus::Alert, breaches.join("; "))
        };

        CheckResult {
            kind: CheckKind::Performance,
            status,
            message,
            details,
        }
    }
}

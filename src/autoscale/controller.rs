//! Autoscaling controller.
//!
//! Each tick sizes the fleet from queue depth, applies hysteresis on the way
//! down and a cooldown after every successful action, and runs single-flight
//! under the `autoscaler:tick` lease.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{ScalingAction, ScalingDecision, ScalingEvent, TickReport};
use super::provisioner::Provisioner;
use crate::clock::Clock;
use crate::config::AutoscaleConfig;
use crate::error::{FleetError, ProvisionError, Result};
use crate::jobs::JobQueue;
use crate::lease::LeaseLock;
use crate::registry::{WorkerRegistry, WorkerStatus, stalest_inactive};
use crate::store::FleetStore;

/// Lease key guarding `Autoscaler::tick`.
pub const TICK_LEASE_KEY: &str = "autoscaler:tick";

/// Workers needed for `queue_depth`, kept within `[min, max]`.
pub fn compute_target(queue_depth: u64, capacity_per_worker: u64, min: u32, max: u32) -> u32 {
    let needed = queue_depth.div_ceil(capacity_per_worker.max(1));
    u32::try_from(needed).unwrap_or(u32::MAX).max(min).min(max)
}

/// Pick an action for `active` workers against `target`.
///
/// `inactive` must be ordered stalest first; scale-down only ever names
/// workers from it.
pub fn decide(active: u32, target: u32, margin: u32, inactive: &[String]) -> ScalingDecision {
    if target > active {
        return ScalingDecision::ScaleUp {
            count: target - active,
        };
    }
    if target < active.saturating_sub(margin) {
        let surplus = (active - target) as usize;
        let worker_ids: Vec<String> = inactive.iter().take(surplus).cloned().collect();
        if worker_ids.is_empty() {
            return ScalingDecision::NoChange {
                reason: format!("{} workers above target but none inactive", active - target),
            };
        }
        return ScalingDecision::ScaleDown { worker_ids };
    }
    ScalingDecision::NoChange {
        reason: if target == active {
            "at target".to_string()
        } else {
            format!("within hysteresis margin of {margin}")
        },
    }
}

pub struct Autoscaler {
    registry: Arc<WorkerRegistry>,
    queue: Arc<dyn JobQueue>,
    provisioner: Arc<dyn Provisioner>,
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    config: AutoscaleConfig,
    lock: LeaseLock,
}

impl Autoscaler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        queue: Arc<dyn JobQueue>,
        provisioner: Arc<dyn Provisioner>,
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        config: AutoscaleConfig,
    ) -> Self {
        let lock = LeaseLock::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            TICK_LEASE_KEY,
            config.lock_ttl,
        );
        Self {
            registry,
            queue,
            provisioner,
            store,
            clock,
            config,
            lock,
        }
    }

    /// Run one evaluation. A concurrent tick gets `ResourceContention`.
    pub async fn tick(&self) -> Result<TickReport> {
        let Some(guard) = self.lock.try_acquire().await? else {
            debug!("Autoscaler tick already in progress");
            return Err(FleetError::contention("autoscaler tick"));
        };

        let result = self.evaluate().await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release autoscaler lease");
        }
        result
    }

    async fn evaluate(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let workers = self.registry.details().await?;
        let active = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Active)
            .count() as u32;
        let inactive_ids: Vec<String> = stalest_inactive(workers)
            .into_iter()
            .map(|w| w.record.worker_id)
            .collect();

        let queue_depth = self.queue.pending_depth().await?;
        let target = compute_target(
            queue_depth,
            self.config.capacity_per_worker,
            self.config.min_workers,
            self.config.max_workers,
        );
        let decision = decide(active, target, self.config.hysteresis_margin, &inactive_ids);

        let mut report = TickReport {
            active_workers: active,
            inactive_workers: inactive_ids.len() as u32,
            queue_depth,
            target,
            decision: decision.clone(),
            executed: false,
            cooldown_until: None,
            evaluated_at: now,
        };

        let (action, requested, worker_ids) = match decision {
            ScalingDecision::NoChange { reason } => {
                debug!(active, target, queue_depth, reason = %reason, "No scaling change");
                return Ok(report);
            }
            ScalingDecision::ScaleUp { count } => (ScalingAction::ScaleUp, count, Vec::new()),
            ScalingDecision::ScaleDown { worker_ids } => {
                (ScalingAction::ScaleDown, worker_ids.len() as u32, worker_ids)
            }
        };

        if let Some(last) = self.store.last_successful_scaling_event().await? {
            let cooldown =
                chrono::Duration::from_std(self.config.cooldown).unwrap_or(chrono::Duration::zero());
            let until = last.created_at + cooldown;
            if now < until {
                info!(
                    action = %action,
                    requested,
                    cooldown_until = %until,
                    "Scaling action suppressed by cooldown"
                );
                report.cooldown_until = Some(until);
                return Ok(report);
            }
        }

        // Bounded so the call always finishes inside the tick lease.
        let limit = self.config.provisioner_timeout;
        let call = async {
            match action {
                ScalingAction::ScaleUp => self.provisioner.scale_up(requested).await,
                ScalingAction::ScaleDown => self.provisioner.scale_down(&worker_ids).await,
            }
        };
        let outcome = tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(ProvisionError::Timeout(limit)));

        let event = ScalingEvent {
            id: Uuid::new_v4(),
            action,
            requested,
            worker_ids,
            target,
            active,
            queue_depth,
            succeeded: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            created_at: now,
        };
        self.store.insert_scaling_event(&event).await?;

        match outcome {
            Ok(()) => {
                info!(
                    action = %action,
                    requested,
                    active,
                    target,
                    queue_depth,
                    "Scaling action executed"
                );
                report.executed = true;
                Ok(report)
            }
            Err(e) => {
                error!(action = %action, requested, error = %e, "Provisioning failed");
                Err(e.into())
            }
        }
    }

    /// Latest scaling events, newest first.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<ScalingEvent>> {
        Ok(self.store.list_scaling_events(limit.clamp(1, 500)).await?)
    }
}

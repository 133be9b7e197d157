//! Wiring of the fleet services over one store and clock.

use std::sync::Arc;

use tracing::info;

use crate::alerts::{AlertEngine, AlertNotifier, CompositeNotifier, LogNotifier, WebhookNotifier};
use crate::autoscale::{Autoscaler, LogProvisioner, Provisioner, WebhookProvisioner};
use crate::clock::Clock;
use crate::config::{AlertConfig, AutoscaleConfig, FleetConfig};
use crate::jobs::{JobLedger, JobQueue};
use crate::pool::PoolManager;
use crate::quota::QuotaController;
use crate::registry::WorkerRegistry;
use crate::store::FleetStore;

/// Every fleet service, sharing one store and clock.
pub struct Fleet {
    pub registry: Arc<WorkerRegistry>,
    pub jobs: Arc<JobLedger>,
    pub quota: Arc<QuotaController>,
    pub autoscaler: Arc<Autoscaler>,
    pub pool: Arc<PoolManager>,
    pub alerts: Arc<AlertEngine>,
}

impl Fleet {
    pub fn new(
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        config: &FleetConfig,
        provisioner: Arc<dyn Provisioner>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.registry.clone(),
        ));
        let jobs = Arc::new(JobLedger::new(Arc::clone(&store), Arc::clone(&clock)));
        let queue: Arc<dyn JobQueue> = jobs.clone();

        let autoscaler = Arc::new(Autoscaler::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            provisioner,
            Arc::clone(&store),
            Arc::clone(&clock),
            config.autoscale.clone(),
        ));
        let quota = Arc::new(QuotaController::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.quota.clone(),
        ));
        let pool = Arc::new(PoolManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.pool.clone(),
        ));
        let alerts = Arc::new(AlertEngine::new(
            store,
            queue,
            notifier,
            clock,
            config.alerts.clone(),
        ));

        Self {
            registry,
            jobs,
            quota,
            autoscaler,
            pool,
            alerts,
        }
    }

    /// Build with the provisioner and notifiers the configuration asks for.
    pub fn from_config(
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        config: &FleetConfig,
    ) -> Self {
        let provisioner = provisioner_for(&config.autoscale);
        let notifier = notifier_for(&config.alerts);
        Self::new(store, clock, config, provisioner, notifier)
    }
}

pub fn provisioner_for(config: &AutoscaleConfig) -> Arc<dyn Provisioner> {
    match &config.provisioner_url {
        Some(url) => {
            info!(url = %url, "Using webhook provisioner");
            Arc::new(WebhookProvisioner::new(url.clone(), config.provisioner_timeout))
        }
        None => Arc::new(LogProvisioner),
    }
}

pub fn notifier_for(config: &AlertConfig) -> Arc<dyn AlertNotifier> {
    let mut notifiers: Vec<Arc<dyn AlertNotifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(url.clone())));
    }
    Arc::new(CompositeNotifier::new(notifiers))
}

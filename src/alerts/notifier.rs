//! Alert delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use super::model::AlertRun;
use crate::error::NotifyError;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that wants to hear about raised alerts.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, run: &AlertRun) -> Result<(), NotifyError>;
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, run: &AlertRun) -> Result<(), NotifyError> {
        warn!(
            dedup_key = %run.dedup_key,
            check = %run.result.kind,
            message = %run.result.message,
            details = %run.result.details,
            "Fleet alert raised"
        );
        Ok(())
    }
}

/// Posts alerts as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, run: &AlertRun) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "dedup_key": run.dedup_key,
            "check": run.result.kind,
            "status": run.result.status,
            "message": run.result.message,
            "details": run.result.details,
            "window_start": run.window_start,
        });

        let resp = self
            .client
            .post(&self.url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::DeliveryFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        info!(dedup_key = %run.dedup_key, "Alert delivered to webhook");
        Ok(())
    }
}

/// Fans an alert out to every inner notifier concurrently.
///
/// Individual failures are logged; the composite itself never fails.
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn AlertNotifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Arc<dyn AlertNotifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl AlertNotifier for CompositeNotifier {
    fn name(&self) -> &str {
        "composite"
    }

    async fn notify(&self, run: &AlertRun) -> Result<(), NotifyError> {
        let results = join_all(self.notifiers.iter().map(|n| n.notify(run))).await;
        for (notifier, result) in self.notifiers.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    notifier = notifier.name(),
                    dedup_key = %run.dedup_key,
                    error = %e,
                    "Alert notification failed"
                );
            }
        }
        Ok(())
    }
}

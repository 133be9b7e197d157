//! Provisioning collaborators that actually add or retire workers.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::ProvisionError;

/// Adds and removes workers on behalf of the autoscaler.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn scale_up(&self, count: u32) -> Result<(), ProvisionError>;

    /// Retire the named workers. Only INACTIVE workers are ever passed.
    async fn scale_down(&self, worker_ids: &[String]) -> Result<(), ProvisionError>;
}

/// Posts `{action, count, worker_ids}` to a webhook.
pub struct WebhookProvisioner {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookProvisioner {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    async fn post(&self, body: serde_json::Value, action: &str) -> Result<(), ProvisionError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProvisionError::Timeout(self.timeout)
                } else {
                    ProvisionError::RequestFailed(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            warn!(action, status = %status, detail = %detail, "Provisioner rejected request");
            return Err(ProvisionError::Rejected {
                action: action.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for WebhookProvisioner {
    async fn scale_up(&self, count: u32) -> Result<(), ProvisionError> {
        self.post(
            serde_json::json!({ "action": "scale_up", "count": count, "worker_ids": [] }),
            "scale_up",
        )
        .await
    }

    async fn scale_down(&self, worker_ids: &[String]) -> Result<(), ProvisionError> {
        self.post(
            serde_json::json!({
                "action": "scale_down",
                "count": worker_ids.len(),
                "worker_ids": worker_ids,
            }),
            "scale_down",
        )
        .await
    }
}

/// Logs requests without acting on them; used when no webhook is set.
#[derive(Debug, Default)]
pub struct LogProvisioner;

#[async_trait]
impl Provisioner for LogProvisioner {
    async fn scale_up(&self, count: u32) -> Result<(), ProvisionError> {
        info!(count, "Scale-up requested (no provisioner configured)");
        Ok(())
    }

    async fn scale_down(&self, worker_ids: &[String]) -> Result<(), ProvisionError> {
        info!(?worker_ids, "Scale-down requested (no provisioner configured)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use std::sync::{Arc, Mutex};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/scale")
    }

    #[tokio::test]
    async fn webhook_posts_scale_requests() {
        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let sink = seen.clone();
        let router = Router::new().route(
            "/scale",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(body);
                    StatusCode::ACCEPTED
                }
            }),
        );
        let provisioner = WebhookProvisioner::new(serve(router).await, Duration::from_secs(5));

        provisioner.scale_up(3).await.unwrap();
        provisioner
            .scale_down(&["w1".to_string(), "w2".to_string()])
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["action"], "scale_up");
        assert_eq!(seen[0]["count"], 3);
        assert_eq!(seen[1]["action"], "scale_down");
        assert_eq!(seen[1]["worker_ids"][1], "w2");
    }

    #[tokio::test]
    async fn webhook_error_status_is_rejection() {
        let router = Router::new().route("/scale", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let provisioner = WebhookProvisioner::new(serve(router).await, Duration::from_secs(5));

        let err = provisioner.scale_up(1).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Rejected { status: 503, .. }));
    }
}

//! Integration tests for the fleet HTTP API.
//!
//! Each test spins up an Axum server on a random port over an in-memory
//! database and exercises the real REST contract with reqwest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use worker_fleet::api::{self, AppState};
use worker_fleet::clock::SystemClock;
use worker_fleet::config::FleetConfig;
use worker_fleet::fleet::Fleet;
use worker_fleet::store::{FleetStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEDULER_TOKEN: &str = "scheduler-test-token";
const ADMIN_TOKEN: &str = "admin-test-token";

fn test_config() -> FleetConfig {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("FLEET_ACTIVE_THRESHOLD_SECS", "120"),
        ("FLEET_FAILED_THRESHOLD_SECS", "600"),
        ("FLEET_CAPACITY_PER_WORKER", "10"),
        ("FLEET_HYSTERESIS_MARGIN", "1"),
        ("FLEET_SCALE_COOLDOWN_SECS", "300"),
        ("FLEET_DEFAULT_QUOTA_LIMIT", "100"),
        ("FLEET_SCHEDULER_TOKEN", SCHEDULER_TOKEN),
        ("FLEET_ADMIN_TOKEN", ADMIN_TOKEN),
        ("FLEET_SCHEDULER_ENABLED", "false"),
    ]);
    FleetConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
}

/// Start an Axum server on a random port, return its base URL.
async fn start_server() -> String {
    let config = test_config();
    let store: Arc<dyn FleetStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let fleet = Arc::new(Fleet::from_config(store, Arc::new(SystemClock), &config));
    let app = api::router(AppState::new(fleet, &config.server));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

async fn json_body(resp: reqwest::Response) -> Value {
    resp.json().await.expect("invalid JSON from server")
}

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn heartbeat_requires_worker_id() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/workers/heartbeat"))
            .json(&json!({ "jobs_processed": 3 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "validation");

        let resp = client
            .post(format!("{base}/api/workers/heartbeat"))
            .json(&json!({ "worker_id": "w1", "jobs_processed": 3, "cpu_usage": 0.4 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["worker_id"], "w1");

        let resp = client.get(format!("{base}/api/workers/w1")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let worker = json_body(resp).await;
        assert_eq!(worker["status"], "ACTIVE");
        assert_eq!(worker["jobs_processed"], 3);

        let stats = json_body(
            client
                .get(format!("{base}/api/workers/stats"))
                .send()
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(stats["active"], 1);
        assert_eq!(stats["total"], 1);

        let resp = client.get(format!("{base}/api/workers/nope")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_bodies_are_validation_errors() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();
        let url = format!("{base}/api/workers/heartbeat");

        for body in [json!({ "worker_id": null }), json!({ "worker_id": 42 })] {
            let resp = client.post(&url).json(&body).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(json_body(resp).await["error"], "validation");
        }

        // No content type at all.
        let resp = client
            .post(&url)
            .body(r#"{"worker_id":"w1"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{base}/api/jobs"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{base}/api/quota/requests"))
            .json(&json!({ "organization_id": "acme", "requested_limit": "lots" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn tick_requires_scheduler_token() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();
        let url = format!("{base}/api/autoscale/tick");

        let resp = client.post(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = client
            .post(&url)
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let resp = client
            .post(&url)
            .bearer_auth(SCHEDULER_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report = json_body(resp).await;
        // No workers and an empty queue: scale up to the minimum of one.
        assert_eq!(report["target"], 1);
        assert_eq!(report["decision"]["action"], "scale_up");

        let events = json_body(
            client
                .get(format!("{base}/api/autoscale/events"))
                .send()
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(events.as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn quota_flow_rejects_over_limit_and_raises_on_approval() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/jobs"))
            .json(&json!({ "organization_id": "acme", "cost": 95 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let admission = json_body(resp).await;
        assert_eq!(admission["current_usage"], 95);

        let resp = client
            .post(format!("{base}/api/jobs"))
            .json(&json!({ "organization_id": "acme", "cost": 10 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["current_usage"], 95);
        assert_eq!(body["limit"], 100);

        let resp = client
            .post(format!("{base}/api/quota/requests"))
            .json(&json!({
                "organization_id": "acme",
                "requested_by": "owner@acme",
                "requested_limit": 500,
                "reason": "launch week",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let request = json_body(resp).await;
        assert_eq!(request["status"], "pending");
        let id = request["id"].as_str().unwrap().to_string();

        let review_url = format!("{base}/api/quota/requests/{id}/review");
        let resp = client
            .post(&review_url)
            .json(&json!({ "approver_id": "", "decision": "approve" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(&review_url)
            .json(&json!({ "approver_id": "admin-1", "decision": "approve" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["reviewed_by"], "admin-1");

        let resp = client
            .post(&review_url)
            .json(&json!({ "approver_id": "admin-2", "decision": "deny" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["state"], "approved");

        let quota = json_body(
            client
                .get(format!("{base}/api/quota/acme"))
                .send()
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(quota["limit"], 500);
        assert_eq!(quota["current_usage"], 95);

        let resp = client
            .post(format!("{base}/api/jobs"))
            .json(&json!({ "organization_id": "acme", "cost": 10 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn alert_check_is_idempotent_per_window() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();
        let url = format!("{base}/api/alerts/check");

        let resp = client.post(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let first = json_body(
            client
                .post(&url)
                .bearer_auth(SCHEDULER_TOKEN)
                .send()
                .await
                .unwrap(),
        )
        .await;
        let second = json_body(
            client
                .post(&url)
                .bearer_auth(SCHEDULER_TOKEN)
                .send()
                .await
                .unwrap(),
        )
        .await;

        // A window boundary may fall between the two calls; only compare
        // when both landed in the same bucket.
        if first["window_start"] == second["window_start"] {
            assert_eq!(second["failure_rate"]["replayed"], true);
            assert_eq!(
                first["failure_rate"]["result"],
                second["failure_rate"]["result"]
            );
        }

        let audit = json_body(
            client
                .get(format!("{base}/api/alerts/audit?limit=10"))
                .send()
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(audit.as_array().unwrap().len(), 4);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pool_maintenance_requires_admin_token() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/pool/reset"))
            .bearer_auth(SCHEDULER_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = client
            .post(format!("{base}/api/pool/reset"))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["force_closed"], 0);

        let resp = client
            .post(format!("{base}/api/pool/configure"))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "target_size": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{base}/api/pool/configure"))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "target_size": 40 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["new_max"], 40);

        let stats = json_body(
            client
                .get(format!("{base}/api/pool/stats"))
                .send()
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(stats["max"], 40);
    })
    .await
    .expect("test timed out");
}

//! Route-level tests: requests go through the full axum router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use cutover_api::{ApiState, build_router};
use cutover_cluster::LocalCluster;
use cutover_core::CutoverConfig;
use cutover_deploy::{Orchestrator, settings_from_config};
use cutover_health::{BoxFuture, CheckResult, HealthCheck, Prober};
use cutover_state::StateStore;
use cutover_traffic::{StoredTraffic, TrafficController};

const CONFIG: &str = r#"
[environments.prod]
private_health_url = "http://{revision}.internal:8080/healthz"
public_health_url = "http://prod.example.com/healthz"

[environments.prod.timeouts]
health = "100ms"
interval = "10ms"
request = "10ms"

[environments.prod.defaults]
name = "web"
cpu = 256
memory_mib = 512
port = 8080
"#;

struct AlwaysHealthy;

impl HealthCheck for AlwaysHealthy {
    fn check<'a>(&'a self, _url: &'a str, _timeout: Duration) -> BoxFuture<'a, CheckResult> {
        Box::pin(async { CheckResult::Pass })
    }
}

fn test_router() -> axum::Router {
    let config = CutoverConfig::from_toml(CONFIG).unwrap();
    let store = StateStore::open_in_memory().unwrap();
    let environments: HashMap<_, _> = settings_from_config(&config).unwrap();
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(LocalCluster::new(store.clone())),
        TrafficController::new(Arc::new(StoredTraffic::new(store))),
        Prober::new(Arc::new(AlwaysHealthy), Duration::from_millis(10)),
        environments,
    );
    build_router(ApiState::new(orchestrator, &config))
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(router: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, json_body(resp).await)
}

async fn post(router: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, json_body(resp).await)
}

/// Poll status until no deployment holds the environment.
async fn wait_idle(router: &axum::Router) -> Value {
    for _ in 0..200 {
        let (_, body) = get(router, "/api/v1/environments/prod/status").await;
        if body["data"]["in_progress"] == false {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("deployment did not finish");
}

#[tokio::test]
async fn deploy_then_status_and_history() {
    let router = test_router();

    let (status, body) = post(
        &router,
        "/api/v1/environments/prod/deploy",
        serde_json::json!({ "image": "registry.example.com/web:v1" }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    let revision = body["data"]["revision"].as_str().unwrap().to_string();

    let body = wait_idle(&router).await;
    assert_eq!(body["data"]["record"]["active"], revision.as_str());
    assert_eq!(body["data"]["record"]["status"], "healthy");
    assert_eq!(body["data"]["split"]["weights"][revision.as_str()], 100);

    let (status, body) = get(&router, "/api/v1/environments/prod/history?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let reports = body["data"].as_array().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["outcome"]["result"], "succeeded");
}

#[tokio::test]
async fn rollback_after_two_deploys() {
    let router = test_router();
    for image in ["web:v1", "web:v2"] {
        let (status, _) = post(
            &router,
            "/api/v1/environments/prod/deploy",
            serde_json::json!({ "image": image }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_idle(&router).await;
    }

    let (status, body) = post(
        &router,
        "/api/v1/environments/prod/rollback",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"]["result"], "rolled_back");

    let (_, body) = get(&router, "/api/v1/environments/prod/status").await;
    assert_eq!(body["data"]["record"]["status"], "rolled_back");
}

#[tokio::test]
async fn unknown_environment_is_not_found() {
    let router = test_router();
    let (status, body) = get(&router, "/api/v1/environments/qa/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn rollback_with_no_history_is_rejected() {
    let router = test_router();
    let (status, body) = post(
        &router,
        "/api/v1/environments/prod/rollback",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("no revision to roll back to"));
}

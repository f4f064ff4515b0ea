//! API regression tests.
//!
//! Drives the full router the daemon serves: nodes register and heartbeat,
//! work is submitted, placed by an on-demand cycle, and reported finished.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use tower::ServiceExt;

use gilliam_api::build_router;
use gilliam_core::{GilliamConfig, LogicalClock};
use gilliam_scheduler::Scheduler;
use gilliam_state::*;

fn test_router() -> (Router, Arc<LogicalClock>) {
    let clock = Arc::new(LogicalClock::new(0));
    let store = StateStore::open_in_memory().unwrap();
    let scheduler = Scheduler::new(&GilliamConfig::default(), store, clock.clone());
    (build_router(Arc::new(scheduler)), clock)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(resp: Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

fn node_body(name: &str, cpu: u64, memory: u64) -> Value {
    let spec = NodeSpec {
        name: name.to_string(),
        capacity: Resources::new(cpu, memory),
        labels: BTreeMap::new(),
    };
    serde_json::to_value(spec).unwrap()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (router, _) = test_router();
    let (status, body) = call(&router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn empty_scheduler_lists_nothing() {
    let (router, _) = test_router();
    for uri in ["/api/v1/work", "/api/v1/nodes", "/api/v1/leases"] {
        let (status, body) = call(&router, get(uri)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], json!([]));
    }
}

#[tokio::test]
async fn work_lifecycle_over_http() {
    let (router, _) = test_router();

    let (status, body) = call(&router, post("/api/v1/nodes", node_body("n1", 4, 1024))).await;
    assert_eq!(status, StatusCode::CREATED);
    let node_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(node_id, "node-000001");

    let work = json!({ "demand": { "cpu": 3, "memory": 512 }, "priority": 1 });
    let (status, body) = call(&router, post("/api/v1/work", work)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "pending");
    let work_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&router, post("/api/v1/cycle", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let placed = &body["data"]["placed"][0];
    assert_eq!(placed["work_unit_id"], work_id.as_str());
    assert_eq!(placed["node_id"], node_id.as_str());
    let lease_id = placed["lease_id"].as_str().unwrap().to_string();

    let (_, body) = call(&router, get(&format!("/api/v1/nodes/{node_id}"))).await;
    assert_eq!(body["data"]["allocated"], json!({ "cpu": 3, "memory": 512 }));

    let (status, body) = call(&router, get(&format!("/api/v1/leases/{lease_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "active");
    assert_eq!(body["data"]["work_unit_id"], work_id.as_str());

    let (status, body) = call(
        &router,
        post(&format!("/api/v1/work/{work_id}/running"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");

    let (status, body) = call(
        &router,
        post(&format!("/api/v1/work/{work_id}/complete"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");

    // The lease is gone and its capacity is back.
    let (status, _) = call(&router, get(&format!("/api/v1/leases/{lease_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = call(&router, get(&format!("/api/v1/nodes/{node_id}"))).await;
    assert_eq!(body["data"]["allocated"], json!({ "cpu": 0, "memory": 0 }));
}

#[tokio::test]
async fn heartbeat_extends_leases() {
    let (router, clock) = test_router();
    call(&router, post("/api/v1/nodes", node_body("n1", 2, 0))).await;
    call(&router, post("/api/v1/work", json!({ "demand": { "cpu": 1 } }))).await;
    let (_, body) = call(&router, post("/api/v1/cycle", json!({}))).await;
    let lease_id = body["data"]["placed"][0]["lease_id"]
        .as_str()
        .unwrap()
        .to_string();

    clock.set(20);
    let (status, body) = call(
        &router,
        post("/api/v1/nodes/node-000001/heartbeat", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["last_heartbeat"], 20);

    let (_, body) = call(&router, get(&format!("/api/v1/leases/{lease_id}"))).await;
    assert_eq!(body["data"]["expires_at"], 50);
}

#[tokio::test]
async fn explicit_renewal_over_http() {
    let (router, clock) = test_router();
    call(&router, post("/api/v1/nodes", node_body("n1", 2, 0))).await;
    call(&router, post("/api/v1/work", json!({ "demand": { "cpu": 1 } }))).await;
    let (_, body) = call(&router, post("/api/v1/cycle", json!({}))).await;
    let lease_id = body["data"]["placed"][0]["lease_id"]
        .as_str()
        .unwrap()
        .to_string();
    let renew_uri = format!("/api/v1/leases/{lease_id}/renew");

    clock.set(10);
    let (status, body) = call(&router, post(&renew_uri, json!({ "ttl": 100 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["expires_at"], 110);
    assert_eq!(body["data"]["renewals"], 1);

    // A shorter renewal leaves the lease alone.
    let (status, body) = call(&router, post(&renew_uri, json!({ "ttl": 5 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["expires_at"], 110);
    assert_eq!(body["data"]["renewals"], 1);

    let (status, body) = call(&router, post(&renew_uri, json!({ "ttl": 0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    clock.set(110);
    let (status, _) = call(&router, post(&renew_uri, json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unplaceable_work_fails_after_retries() {
    let (router, _) = test_router();
    call(&router, post("/api/v1/nodes", node_body("n1", 2, 0))).await;
    let (_, body) = call(&router, post("/api/v1/work", json!({ "demand": { "cpu": 8 } }))).await;
    let work_id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = call(&router, post("/api/v1/cycle", json!({}))).await;
    assert_eq!(body["data"]["unplaced"], json!([work_id]));
    call(&router, post("/api/v1/cycle", json!({}))).await;
    let (_, body) = call(&router, post("/api/v1/cycle", json!({}))).await;
    assert_eq!(body["data"]["failed"], json!([work_id]));

    let (_, body) = call(&router, get(&format!("/api/v1/work/{work_id}"))).await;
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["attempts"], 3);
    assert!(
        body["data"]["failure_reason"]
            .as_str()
            .unwrap()
            .contains("no eligible node")
    );
}

#[tokio::test]
async fn deregistering_a_node_requeues_its_work() {
    let (router, _) = test_router();
    call(&router, post("/api/v1/nodes", node_body("n1", 4, 0))).await;
    let (_, body) = call(&router, post("/api/v1/work", json!({ "demand": { "cpu": 2 } }))).await;
    let work_id = body["data"]["id"].as_str().unwrap().to_string();
    call(&router, post("/api/v1/cycle", json!({}))).await;

    let (status, _) = call(&router, delete("/api/v1/nodes/node-000001")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&router, get(&format!("/api/v1/work/{work_id}"))).await;
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["lease_id"], Value::Null);
    let (_, body) = call(&router, get("/api/v1/leases")).await;
    assert_eq!(body["data"], json!([]));
    let (status, _) = call(&router, get("/api/v1/nodes/node-000001")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn withdraw_and_failure_reports() {
    let (router, _) = test_router();
    call(&router, post("/api/v1/nodes", node_body("n1", 4, 0))).await;
    let (_, a) = call(&router, post("/api/v1/work", json!({ "demand": { "cpu": 1 } }))).await;
    let (_, b) = call(&router, post("/api/v1/work", json!({ "demand": { "cpu": 1 } }))).await;
    let a = a["data"]["id"].as_str().unwrap().to_string();
    let b = b["data"]["id"].as_str().unwrap().to_string();
    call(&router, post("/api/v1/cycle", json!({}))).await;

    let (status, body) = call(
        &router,
        post(&format!("/api/v1/work/{a}/fail"), json!({ "reason": "exit code 137" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["failure_reason"], "exit code 137");

    // Failed work can't be started.
    let (status, _) = call(&router, post(&format!("/api/v1/work/{a}/running"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&router, delete(&format!("/api/v1/work/{b}"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&router, get(&format!("/api/v1/work/{b}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(&router, get("/api/v1/nodes/node-000001")).await;
    assert_eq!(body["data"]["allocated"]["cpu"], 0);
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let (router, _) = test_router();

    let (status, body) = call(&router, post("/api/v1/nodes", node_body("empty", 0, 0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let bad_pattern = json!({
        "demand": { "cpu": 1 },
        "constraints": [{ "type": "label_matches", "key": "zone", "pattern": "(" }]
    });
    let (status, _) = call(&router, post("/api/v1/work", bad_pattern)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    for uri in [
        "/api/v1/work/wu-999999",
        "/api/v1/nodes/node-999999",
        "/api/v1/leases/lease-999999",
    ] {
        let (status, body) = call(&router, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body["error"].as_str().is_some());
    }
}

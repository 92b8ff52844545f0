// ABOUTME: Tests for the HTTP JSON API - routing, status mapping, auth, job CRUD
// ABOUTME: Drives the axum router directly with tower's oneshot; no sockets involved

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use crosswire::config::RunnerConfig;
use crosswire::runner::ProcessAgentRunner;
use crosswire::server::{self, AppState};
use crosswire_core::clock::{Clock, ManualClock};
use crosswire_core::config::{CronConfig, RequestLimits};
use crosswire_core::cron::CronService;
use crosswire_core::dispatch::AgentDispatcher;
use crosswire_core::events::Observers;
use crosswire_core::requests::RequestRegistry;
use crosswire_core::store::{JobStore, MemoryJobStore, MemoryRequestStore, RequestStore};

const T0: u64 = 1_700_000_000_000;

// The Prometheus recorder can only be installed once per process
fn metrics_handle() -> Arc<PrometheusHandle> {
    static HANDLE: OnceLock<Arc<PrometheusHandle>> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            Arc::new(crosswire_core::metrics::init_metrics().expect("install metrics recorder"))
        })
        .clone()
}

async fn test_state(api_key: Option<&str>) -> AppState {
    let clock = ManualClock::new(T0);
    let observers = Arc::new(Observers::new());
    let registry = Arc::new(
        RequestRegistry::load(
            Arc::new(MemoryRequestStore::new()) as Arc<dyn RequestStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&observers),
            RequestLimits::default(),
        )
        .await,
    );
    let runner = ProcessAgentRunner::new(RunnerConfig::default());
    let cron = Arc::new(
        CronService::load(
            Arc::new(MemoryJobStore::new()) as Arc<dyn JobStore>,
            Arc::clone(&runner) as Arc<dyn AgentDispatcher>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            observers,
            CronConfig::default(),
        )
        .await,
    );
    AppState {
        registry,
        cron,
        runner,
        api_key: api_key.map(|k| k.to_string()),
        metrics_handle: metrics_handle(),
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("parse body")
}

fn create_request_body() -> Value {
    json!({
        "child_session_key": "child-a",
        "parent_session_key": "parent-a",
        "message": "ping"
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = server::router(test_state(None).await);
    let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_request_lifecycle_over_http() {
    let app = server::router(test_state(None).await);

    // Create
    let response = app
        .clone()
        .oneshot(json_request("POST", "/requests", create_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let request_id = body["request_id"].as_str().unwrap().to_string();
    assert!(request_id.starts_with("req_"));

    // Fetch it back
    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/requests/{}", request_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");

    // Resolve
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/requests/{}/resolve", request_id),
            json!({"response": "pong", "resolved_by_session_key": "parent-a"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "resolved");
    assert_eq!(body["response"], "pong");

    // Second resolve loses the race cleanly
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/requests/{}/resolve", request_id),
            json!({"response": "late", "resolved_by_session_key": "parent-b"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "conflict");

    // Waiting on a terminal record returns it immediately
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/requests/{}/wait", request_id),
            json!({"timeout_ms": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_capacity_violation_maps_to_429() {
    let app = server::router(test_state(None).await);

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/requests", create_request_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(json_request("POST", "/requests", create_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"], "capacity");
    assert!(body["message"].as_str().unwrap().contains("pending requests"));
}

#[tokio::test]
async fn test_unknown_request_maps_to_404() {
    let app = server::router(test_state(None).await);
    let response = app
        .oneshot(empty_request("GET", "/requests/req_missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_pending_requires_a_filter() {
    let app = server::router(test_state(None).await);

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/requests/pending"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/requests", create_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(empty_request("GET", "/requests/pending?parent=parent-a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_bulk_cancel_endpoint() {
    let app = server::router(test_state(None).await);

    for _ in 0..2 {
        app.clone()
            .oneshot(json_request("POST", "/requests", create_request_body()))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(empty_request("POST", "/sessions/child-a/cancel-requests"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["finished"], 2);
}

#[tokio::test]
async fn test_job_crud_over_http() {
    let app = server::router(test_state(None).await);

    // Create an isolated job with delivery routing
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/jobs",
            json!({
                "name": "nightly-digest",
                "schedule": {"kind": "every", "every_ms": 86_400_000u64},
                "session_target": "isolated",
                "payload": {"kind": "agent_turn", "message": "summarize the day"},
                "delivery": {"mode": "announce", "to": "#ops", "best_effort": false}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let job_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["name"], "nightly-digest");
    assert_eq!(body["delivery"]["to"], "#ops");
    assert!(body["state"]["next_run_at_ms"].is_u64());

    // Patch to the main session: delivery must clear
    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/jobs/{}", job_id),
            json!({"session_target": "main"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["session_target"], "main");
    assert!(body["delivery"].is_null());

    // Listed
    let response = app.clone().oneshot(empty_request("GET", "/jobs")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Delete, then 404
    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/jobs/{}", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(empty_request("GET", &format!("/jobs/{}", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_job_schedule_maps_to_400() {
    let app = server::router(test_state(None).await);

    let response = app
        .oneshot(json_request(
            "POST",
            "/jobs",
            json!({
                "name": "broken",
                "schedule": {"kind": "cron", "expr": "not a cron"},
                "session_target": "main",
                "payload": {"kind": "system_event", "text": "tick"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn test_run_job_now_endpoint() {
    let app = server::router(test_state(None).await);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/jobs",
            json!({
                "name": "event-job",
                "schedule": {"kind": "every", "every_ms": 60_000},
                "session_target": "main",
                "payload": {"kind": "system_event", "text": "tick"},
                "enabled": false
            }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let job_id = body["id"].as_str().unwrap().to_string();

    // Forced run executes even a disabled job
    let response = app
        .clone()
        .oneshot(empty_request("POST", &format!("/jobs/{}/run", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");

    // The system event is visible on the inspection endpoint
    let response = app.oneshot(empty_request("GET", "/events")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["text"], "tick");
}

#[tokio::test]
async fn test_api_key_guards_mutations() {
    let app = server::router(test_state(Some("hunter2")).await);

    // Missing key
    let response = app
        .clone()
        .oneshot(json_request("POST", "/requests", create_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key
    let request = Request::builder()
        .method("POST")
        .uri("/requests")
        .header("content-type", "application/json")
        .header("x-api-key", "wrong")
        .body(Body::from(create_request_body().to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Correct key
    let request = Request::builder()
        .method("POST")
        .uri("/requests")
        .header("content-type", "application/json")
        .header("x-api-key", "hunter2")
        .body(Body::from(create_request_body().to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Reads stay open
    let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_renders() {
    let app = server::router(test_state(None).await);
    let response = app.oneshot(empty_request("GET", "/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

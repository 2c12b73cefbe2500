// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API tests driving the router in-process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use durastate_core::adapter::ConnectorService;
use durastate_core::error::StepError;
use durastate_core::persistence::{CheckpointStore, SqliteStore};
use durastate_core::{EngineConfig, EngineRuntime, WorkflowCatalog};
use durastate_server::{AppState, build_router};

/// Connection service keeping a single state in memory.
struct InMemoryConnector {
    state: Mutex<Value>,
}

#[async_trait]
impl ConnectorService for InMemoryConnector {
    async fn get_state(&self, resource_id: &str) -> Result<Value, StepError> {
        if resource_id == "missing" {
            return Err(StepError::Permanent("Connection not found".to_string()));
        }
        Ok(json!({ "id": resource_id, "state": self.state.lock().unwrap().clone() }))
    }

    async fn pause(&self, resource_id: &str) -> Result<Value, StepError> {
        Ok(json!({ "id": resource_id, "paused": true }))
    }

    async fn update_state(&self, resource_id: &str, new_state: &Value) -> Result<Value, StepError> {
        *self.state.lock().unwrap() = new_state.clone();
        Ok(json!({ "id": resource_id, "state": new_state }))
    }

    async fn resume(&self, resource_id: &str) -> Result<Value, StepError> {
        Ok(json!({ "id": resource_id, "paused": false }))
    }

    async fn verify_state(&self, resource_id: &str, _expected: &Value) -> Result<Value, StepError> {
        Ok(json!({ "id": resource_id, "state": self.state.lock().unwrap().clone() }))
    }
}

async fn start_app() -> (Router, EngineRuntime) {
    let store: Arc<dyn CheckpointStore> =
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let connector = Arc::new(InMemoryConnector {
        state: Mutex::new(json!({"mode": "old"})),
    });

    let mut config = EngineConfig::new("sqlite::memory:");
    config.worker_id = "api-test".to_string();
    config.retry_backoff = Duration::from_millis(5);

    let runtime = EngineRuntime::builder()
        .store(store)
        .config(config)
        .catalog(WorkflowCatalog::for_connector(connector))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let app = build_router(AppState::new(runtime.service().clone()));
    (app, runtime)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_terminal(app: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, get(&format!("/workflows/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(
            body["status"].as_str(),
            Some("COMPLETED" | "FAILED" | "COMPENSATED")
        ) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {} did not finish", id);
}

#[tokio::test]
async fn test_api_info() {
    let (app, runtime) = start_app().await;

    let (status, body) = send(&app, get("/api/info")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "Durastate Connection State Manager");
    assert!(body["endpoints"]["POST /workflows"].is_string());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_ok() {
    let (app, runtime) = start_app().await;

    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "ok");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_update_state_and_poll() {
    let (app, runtime) = start_app().await;

    let (status, receipt) = send(
        &app,
        post_json(
            "/workflows",
            json!({
                "workflow": "UpdateState",
                "input": {"resource_id": "conn-1", "new_state": {"mode": "new"}},
                "id": "wf-http-1",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(receipt["id"], "wf-http-1");
    assert_eq!(receipt["created"], true);

    let view = wait_terminal(&app, "wf-http-1").await;
    assert_eq!(view["status"], "COMPLETED");
    assert_eq!(view["workflow_name"], "UpdateState");
    assert_eq!(
        view["output"]["message"],
        "State updated and verified successfully"
    );
    assert_eq!(view["output"]["current_state"]["state"], json!({"mode": "old"}));
    assert_eq!(view["steps"].as_array().unwrap().len(), 5);
    assert!(view.get("error").is_none());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resubmit_same_id_returns_existing() {
    let (app, runtime) = start_app().await;
    let request = json!({
        "workflow": "GetState",
        "input": {"resource_id": "conn-1"},
        "id": "wf-dup",
    });

    let (first, _) = send(&app, post_json("/workflows", request.clone())).await;
    assert_eq!(first, StatusCode::ACCEPTED);
    wait_terminal(&app, "wf-dup").await;

    let (second, receipt) = send(&app, post_json("/workflows", request)).await;
    assert_eq!(second, StatusCode::OK);
    assert_eq!(receipt["created"], false);
    assert_eq!(receipt["status"], "COMPLETED");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_reported() {
    let (app, runtime) = start_app().await;

    let (status, receipt) = send(
        &app,
        post_json(
            "/workflows",
            json!({"workflow": "GetState", "input": {"resource_id": "missing"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let view = wait_terminal(&app, receipt["id"].as_str().unwrap()).await;
    assert_eq!(view["status"], "FAILED");
    assert_eq!(view["error"]["step"], "GetCurrentState");
    assert!(
        view["error"]["cause"]
            .as_str()
            .unwrap()
            .contains("Connection not found")
    );
    assert_eq!(view["error"]["retryable"], false);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_validation_errors() {
    let (app, runtime) = start_app().await;

    let (status, body) = send(
        &app,
        post_json(
            "/workflows",
            json!({"workflow": "UpdateState", "input": {"resource_id": "conn-1"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app,
        post_json(
            "/workflows",
            json!({"workflow": "DeleteEverything", "input": {"resource_id": "conn-1"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "UNKNOWN_WORKFLOW");

    let malformed = Request::builder()
        .method("POST")
        .uri("/workflows")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (_, list) = send(&app, get("/workflows")).await;
    assert!(list["instances"].as_array().unwrap().is_empty());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_instance_is_404() {
    let (app, runtime) = start_app().await;

    let (status, body) = send(&app, get("/workflows/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "INSTANCE_NOT_FOUND");

    let (status, _) = send(&app, post_json("/workflows/nope/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_terminal_instance_is_noop() {
    let (app, runtime) = start_app().await;

    send(
        &app,
        post_json(
            "/workflows",
            json!({"workflow": "GetState", "input": {"resource_id": "conn-1"}, "id": "wf-done"}),
        ),
    )
    .await;
    wait_terminal(&app, "wf-done").await;

    let (status, view) = send(&app, post_json("/workflows/wf-done/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "COMPLETED");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let (app, runtime) = start_app().await;

    for id in ["wf-l1", "wf-l2"] {
        send(
            &app,
            post_json(
                "/workflows",
                json!({"workflow": "GetState", "input": {"resource_id": "conn-1"}, "id": id}),
            ),
        )
        .await;
        wait_terminal(&app, id).await;
    }

    let (status, body) = send(&app, get("/workflows?status=COMPLETED")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instances"].as_array().unwrap().len(), 2);

    let (_, body) = send(&app, get("/workflows?status=failed")).await;
    assert!(body["instances"].as_array().unwrap().is_empty());

    let (_, body) = send(&app, get("/workflows?limit=1&offset=1")).await;
    assert_eq!(body["instances"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app, get("/workflows?status=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(&app, get("/workflows?limit=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    runtime.shutdown().await.unwrap();
}

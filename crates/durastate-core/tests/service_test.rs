// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submission API: validation, idempotency, polling, cancellation, listing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use durastate_core::error::EngineError;
use durastate_core::model::{InstanceStatus, WorkflowView};
use durastate_core::service::WorkflowService;
use serde_json::json;
use tokio::sync::Semaphore;

fn service(
    store: Arc<dyn durastate_core::CheckpointStore>,
    connector: Arc<FakeConnector>,
) -> WorkflowService {
    WorkflowService::new(
        orchestrator(store, connector, "worker-a"),
        Arc::new(Semaphore::new(4)),
    )
}

async fn wait_terminal(service: &WorkflowService, id: &str) -> WorkflowView {
    for _ in 0..100 {
        let view = service.get(id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("instance {} did not finish", id);
}

#[tokio::test]
async fn test_submit_runs_to_completion() {
    let store = memory_store().await;
    let connector = FakeConnector::new(json!({"mode": "old"}));
    let service = service(store, connector.clone());

    let receipt = service
        .submit("UpdateState", update_input(json!({"mode": "new"})), None)
        .await
        .unwrap();
    assert!(receipt.created);
    assert_eq!(receipt.status, InstanceStatus::Pending);
    assert!(uuid::Uuid::parse_str(&receipt.id).is_ok());

    let view = wait_terminal(&service, &receipt.id).await;
    assert_eq!(view.status, InstanceStatus::Completed);
    assert_eq!(
        view.output.unwrap()["message"],
        "State updated and verified successfully"
    );

    service.shutdown().await;
    assert_eq!(service.in_flight(), 0);
}

#[tokio::test]
async fn test_submit_is_idempotent_on_id() {
    let store = memory_store().await;
    let connector = FakeConnector::new(json!({}));
    let service = service(store, connector.clone());

    let first = service
        .submit(
            "UpdateState",
            update_input(json!({"mode": "new"})),
            Some("req-1".to_string()),
        )
        .await
        .unwrap();
    assert!(first.created);
    wait_terminal(&service, "req-1").await;

    let second = service
        .submit(
            "UpdateState",
            update_input(json!({"mode": "other"})),
            Some("req-1".to_string()),
        )
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.id, "req-1");
    assert_eq!(second.status, InstanceStatus::Completed);

    service.shutdown().await;
    assert_eq!(connector.count(Capability::Pause), 1);
    assert_eq!(connector.state(), json!({"mode": "new"}));
}

#[tokio::test]
async fn test_submit_validation() {
    let store = memory_store().await;
    let connector = FakeConnector::new(json!({}));
    let service = service(store.clone(), connector);

    let err = service
        .submit("UpdateState", json!({"resource_id": RESOURCE}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "new_state"));

    let err = service
        .submit("GetState", json!({"resource_id": "  "}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "resource_id"));

    let err = service
        .submit("DeleteEverything", json!({"resource_id": RESOURCE}), None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNKNOWN_WORKFLOW");

    let err = service
        .submit(
            "GetState",
            json!({"resource_id": RESOURCE}),
            Some(String::new()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "id"));

    // Nothing was persisted.
    assert!(
        store
            .list_instances(None, 10, 0)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_get_unknown_instance() {
    let store = memory_store().await;
    let service = service(store, FakeConnector::new(json!({})));

    let err = service.get("nope").await.unwrap_err();
    assert_eq!(err.error_code(), "INSTANCE_NOT_FOUND");
    let err = service.cancel("nope").await.unwrap_err();
    assert_eq!(err.error_code(), "INSTANCE_NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_in_flight_submission() {
    let store = memory_store().await;
    let connector = FakeConnector::new(json!({}));
    connector.set_delay(Duration::from_millis(100));
    let service = service(store, connector.clone());

    let receipt = service
        .submit("UpdateState", update_input(json!({"mode": "new"})), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let view = service.cancel(&receipt.id).await.unwrap();
    assert_eq!(view.status, InstanceStatus::Cancelling);

    let view = wait_terminal(&service, &receipt.id).await;
    assert_eq!(view.status, InstanceStatus::Failed);
    assert_eq!(view.error.unwrap().step, "cancelled");
    assert_eq!(connector.count(Capability::Pause), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn test_list_filters_and_pages() {
    let store = memory_store().await;
    let connector = FakeConnector::new(json!({}));
    let service = service(store.clone(), connector);

    for i in 0..3 {
        let id = format!("wf-{}", i);
        service
            .submit("GetState", json!({"resource_id": RESOURCE}), Some(id.clone()))
            .await
            .unwrap();
        wait_terminal(&service, &id).await;
    }
    create_update(&store, "wf-pending", json!({"mode": "new"})).await;

    let all = service.list(None, None, None).await.unwrap();
    assert_eq!(all.len(), 4);

    let completed = service
        .list(Some(InstanceStatus::Completed), None, None)
        .await
        .unwrap();
    assert_eq!(completed.len(), 3);

    let pending = service
        .list(Some(InstanceStatus::Pending), None, None)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "wf-pending");

    let page = service.list(None, Some(2), Some(3)).await.unwrap();
    assert_eq!(page.len(), 1);

    // Limit is clamped to at least one row.
    let page = service.list(None, Some(0), None).await.unwrap();
    assert_eq!(page.len(), 1);

    assert!(service.health().await.unwrap());
    service.shutdown().await;
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests. Require TEST_DATABASE_URL.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use durastate_core::error::EngineError;
use durastate_core::model::{InstanceStatus, StepRecord, StepStatus};
use durastate_core::persistence::{CheckpointStore, PostgresStore};
use serde_json::json;
use uuid::Uuid;

async fn pg_store() -> Option<Arc<dyn CheckpointStore>> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let store = PostgresStore::connect(&url).await.ok()?;
    Some(Arc::new(store))
}

fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pg_update_state_completes() {
    skip_if_no_db!();
    let Some(store) = pg_store().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };
    let connector = FakeConnector::new(json!({"mode": "old"}));
    let id = unique_id("pg-a");
    create_update(&store, &id, json!({"mode": "new"})).await;

    let view = orchestrator(store.clone(), connector.clone(), "worker-a")
        .run(&id)
        .await
        .unwrap();

    assert_eq!(view.status, InstanceStatus::Completed);
    assert_eq!(view.steps.len(), 5);
    assert_eq!(connector.count(Capability::Pause), 1);
    assert!(store.get_instance(&id).await.unwrap().unwrap().lease.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pg_lease_and_fencing() {
    skip_if_no_db!();
    let Some(store) = pg_store().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };
    let id = unique_id("pg-lease");
    create_update(&store, &id, json!({"mode": "new"})).await;

    let lease = store
        .acquire_lease(&id, "worker-a", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert!(
        store
            .acquire_lease(&id, "worker-b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .acquire_lease(&id, "worker-a", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );

    let mut record = StepRecord::pending(0, "GetCurrentState");
    record.attempt_count = 1;
    let err = store
        .append_or_update_step(&id, "worker-b", &record)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LeaseLost { .. }));

    record.status = StepStatus::Completed;
    record.output = Some(json!({"v": 1}));
    store
        .append_or_update_step(&id, "worker-a", &record)
        .await
        .unwrap();
    // Identical rewrite is a no-op, a different output conflicts.
    store
        .append_or_update_step(&id, "worker-a", &record)
        .await
        .unwrap();
    record.output = Some(json!({"v": 2}));
    let err = store
        .append_or_update_step(&id, "worker-a", &record)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { index: 0, .. }));

    store.release_lease(&lease).await.unwrap();
    assert!(
        store
            .acquire_lease(&id, "worker-b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pg_crash_after_pause_recovers() {
    skip_if_no_db!();
    let Some(store) = pg_store().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };
    let connector = FakeConnector::new(json!({"mode": "old"}));
    let id = unique_id("pg-c");
    create_update(&store, &id, json!({"mode": "new"})).await;

    run_then_crash(&store, connector.clone(), &id, 1).await;
    wait_for_lease_expiry().await;

    // The database is shared with other tests, so resume this instance
    // directly rather than sweeping everything recoverable.
    let recoverable = store.list_recoverable(Utc::now(), 10_000).await.unwrap();
    assert!(recoverable.contains(&id));
    orchestrator(store.clone(), connector.clone(), "worker-recovery")
        .run(&id)
        .await
        .unwrap();

    let instance = store.get_instance(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(connector.count(Capability::Pause), 1);
    assert_eq!(connector.count(Capability::GetState), 1);
}

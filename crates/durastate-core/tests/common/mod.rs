// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for durastate-core integration tests.
//!
//! Provides an in-process fake of the remote connection service, store
//! helpers, and a way to simulate a worker that crashes mid-workflow.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use durastate_core::adapter::{ConnectorService, state_contains};
use durastate_core::config::EngineConfig;
use durastate_core::error::StepError;
use durastate_core::executor::{ExecutionContext, StepExecutor};
use durastate_core::lease::LeaseManager;
use durastate_core::model::{InstanceStatus, WorkflowInstance, WorkflowName};
use durastate_core::orchestrator::Orchestrator;
use durastate_core::persistence::{CheckpointStore, SqliteStore, StatusUpdate};
use durastate_core::workflow::{WorkflowCatalog, WorkflowDefinition};

/// Resource id used by most tests.
pub const RESOURCE: &str = "conn-1";

/// Connector capabilities, as counted by [`FakeConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    GetState,
    Pause,
    UpdateState,
    Resume,
    VerifyState,
}

/// In-memory stand-in for the remote connection service.
///
/// Counts every call, keeps a paused flag plus the current state, and can be
/// told to fail specific capabilities.
pub struct FakeConnector {
    state: Mutex<Value>,
    paused: Mutex<bool>,
    counts: HashMap<Capability, AtomicU32>,
    queued: Mutex<HashMap<Capability, VecDeque<StepError>>>,
    always: Mutex<HashMap<Capability, StepError>>,
    delay: Mutex<Option<Duration>>,
    cancel_on_pause: Mutex<Option<(Arc<dyn CheckpointStore>, String)>>,
    status_watch: Mutex<Option<(Arc<dyn CheckpointStore>, String)>>,
    observed: Mutex<Vec<(Capability, InstanceStatus)>>,
}

impl FakeConnector {
    pub fn new(initial_state: Value) -> Arc<Self> {
        let counts = [
            Capability::GetState,
            Capability::Pause,
            Capability::UpdateState,
            Capability::Resume,
            Capability::VerifyState,
        ]
        .into_iter()
        .map(|c| (c, AtomicU32::new(0)))
        .collect();

        Arc::new(Self {
            state: Mutex::new(initial_state),
            paused: Mutex::new(false),
            counts,
            queued: Mutex::new(HashMap::new()),
            always: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            cancel_on_pause: Mutex::new(None),
            status_watch: Mutex::new(None),
            observed: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next call of `capability` with `error`.
    pub fn fail_next(&self, capability: Capability, error: StepError) {
        self.queued
            .lock()
            .unwrap()
            .entry(capability)
            .or_default()
            .push_back(error);
    }

    /// Fail every call of `capability` with `error`.
    pub fn fail_always(&self, capability: Capability, error: StepError) {
        self.always.lock().unwrap().insert(capability, error);
    }

    /// Sleep before answering every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Request cancellation of `instance_id` while the pause call is in flight.
    pub fn cancel_during_pause(&self, store: Arc<dyn CheckpointStore>, instance_id: &str) {
        *self.cancel_on_pause.lock().unwrap() = Some((store, instance_id.to_string()));
    }

    /// Record the persisted status of `instance_id` at every call.
    pub fn watch_status(&self, store: Arc<dyn CheckpointStore>, instance_id: &str) {
        *self.status_watch.lock().unwrap() = Some((store, instance_id.to_string()));
    }

    /// Statuses seen by calls of `capability`, in call order.
    pub fn statuses_seen(&self, capability: Capability) -> Vec<InstanceStatus> {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == capability)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn count(&self, capability: Capability) -> u32 {
        self.counts[&capability].load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    pub fn state(&self) -> Value {
        self.state.lock().unwrap().clone()
    }

    async fn enter(&self, capability: Capability) -> Result<(), StepError> {
        self.counts[&capability].fetch_add(1, Ordering::SeqCst);
        let watch = self.status_watch.lock().unwrap().clone();
        if let Some((store, instance_id)) = watch
            && let Ok(Some(status)) = store.get_status(&instance_id).await
        {
            self.observed.lock().unwrap().push((capability, status));
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&capability)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = self.always.lock().unwrap().get(&capability) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectorService for FakeConnector {
    async fn get_state(&self, resource_id: &str) -> Result<Value, StepError> {
        self.enter(Capability::GetState).await?;
        Ok(json!({ "id": resource_id, "state": self.state() }))
    }

    async fn pause(&self, resource_id: &str) -> Result<Value, StepError> {
        self.enter(Capability::Pause).await?;
        let hook = self.cancel_on_pause.lock().unwrap().take();
        if let Some((store, instance_id)) = hook {
            store
                .request_cancel(&instance_id)
                .await
                .map_err(|e| StepError::Transient(e.to_string()))?;
        }
        *self.paused.lock().unwrap() = true;
        Ok(json!({ "id": resource_id, "paused": true }))
    }

    async fn update_state(&self, resource_id: &str, new_state: &Value) -> Result<Value, StepError> {
        self.enter(Capability::UpdateState).await?;
        *self.state.lock().unwrap() = new_state.clone();
        Ok(json!({ "id": resource_id, "state": new_state }))
    }

    async fn resume(&self, resource_id: &str) -> Result<Value, StepError> {
        self.enter(Capability::Resume).await?;
        *self.paused.lock().unwrap() = false;
        Ok(json!({ "id": resource_id, "paused": false }))
    }

    async fn verify_state(&self, resource_id: &str, expected: &Value) -> Result<Value, StepError> {
        self.enter(Capability::VerifyState).await?;
        let actual = self.state();
        if !state_contains(&actual, expected) {
            return Err(StepError::Transient(format!(
                "state of '{}' does not match yet",
                resource_id
            )));
        }
        Ok(json!({ "id": resource_id, "state": actual }))
    }
}

/// Fast retry policy for tests.
pub fn test_config(worker_id: &str) -> EngineConfig {
    let mut config = EngineConfig::new("sqlite::memory:");
    config.worker_id = worker_id.to_string();
    config.lease_ttl = Duration::from_secs(5);
    config.recovery_interval = Duration::from_millis(50);
    config.step_timeout = Duration::from_secs(2);
    config.max_step_attempts = 3;
    config.retry_backoff = Duration::from_millis(5);
    config.max_concurrent_instances = 4;
    config
}

pub async fn memory_store() -> Arc<dyn CheckpointStore> {
    Arc::new(
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory store"),
    )
}

/// An orchestrator for `worker_id` over `store` and the connector's catalog.
pub fn orchestrator(
    store: Arc<dyn CheckpointStore>,
    connector: Arc<FakeConnector>,
    worker_id: &str,
) -> Arc<Orchestrator> {
    orchestrator_with(
        store,
        WorkflowCatalog::for_connector(connector),
        test_config(worker_id),
    )
}

pub fn orchestrator_with(
    store: Arc<dyn CheckpointStore>,
    catalog: WorkflowCatalog,
    config: EngineConfig,
) -> Arc<Orchestrator> {
    let leases = Arc::new(LeaseManager::new(
        store.clone(),
        config.worker_id.clone(),
        config.lease_ttl,
    ));
    Arc::new(Orchestrator::new(store, Arc::new(catalog), leases, config))
}

pub fn update_input(new_state: Value) -> Value {
    json!({ "resource_id": RESOURCE, "new_state": new_state })
}

pub async fn create_update(store: &Arc<dyn CheckpointStore>, id: &str, new_state: Value) {
    let created = store
        .create_instance(&WorkflowInstance::new(
            id,
            WorkflowName::UpdateState,
            update_input(new_state),
        ))
        .await
        .expect("Failed to create instance");
    assert!(created, "instance {} already existed", id);
}

/// Lease TTL of the crashing worker; recovery waits a bit longer.
pub const CRASH_LEASE_TTL: Duration = Duration::from_millis(300);

/// Run steps `0..=last` of the UpdateState workflow as `worker-crashed`,
/// then stop without releasing the lease, as if the process died right after
/// the checkpoint of step `last`.
pub async fn run_then_crash(
    store: &Arc<dyn CheckpointStore>,
    connector: Arc<FakeConnector>,
    instance_id: &str,
    last: usize,
) {
    let worker = CrashingWorker::start(store, connector, instance_id).await;
    let mut outputs = Vec::new();
    for index in 0..=last {
        outputs.push(
            worker
                .execute(index, &outputs)
                .await
                .expect("step failed before the simulated crash"),
        );
    }
}

/// Like [`run_then_crash`], but step `failing` fails and the process dies
/// right after its FAILED checkpoint, before the instance status moves on.
pub async fn fail_then_crash(
    store: &Arc<dyn CheckpointStore>,
    connector: Arc<FakeConnector>,
    instance_id: &str,
    failing: usize,
) {
    let worker = CrashingWorker::start(store, connector, instance_id).await;
    let mut outputs = Vec::new();
    for index in 0..failing {
        outputs.push(
            worker
                .execute(index, &outputs)
                .await
                .expect("step failed before the simulated crash"),
        );
    }
    worker
        .execute(failing, &outputs)
        .await
        .expect_err("step should fail before the simulated crash");
}

struct CrashingWorker {
    executor: StepExecutor,
    definition: WorkflowDefinition,
    ctx: ExecutionContext,
}

impl CrashingWorker {
    const HOLDER: &'static str = "worker-crashed";

    async fn start(
        store: &Arc<dyn CheckpointStore>,
        connector: Arc<FakeConnector>,
        instance_id: &str,
    ) -> Self {
        store
            .acquire_lease(instance_id, Self::HOLDER, CRASH_LEASE_TTL)
            .await
            .expect("acquire failed")
            .expect("lease should be free");
        store
            .set_status(
                instance_id,
                Self::HOLDER,
                &StatusUpdate::status(InstanceStatus::Running),
            )
            .await
            .expect("set_status failed");

        let instance = store
            .get_instance(instance_id)
            .await
            .expect("get_instance failed")
            .expect("instance missing");
        Self {
            executor: StepExecutor::new(store.clone(), Duration::from_secs(2)),
            definition: WorkflowDefinition::update_state(connector),
            ctx: ExecutionContext {
                instance_id: instance_id.to_string(),
                holder_id: Self::HOLDER.to_string(),
                input: instance.input,
            },
        }
    }

    async fn execute(
        &self,
        index: usize,
        outputs: &[Value],
    ) -> durastate_core::error::Result<Value> {
        self.executor
            .execute(&self.ctx, index, self.definition.steps[index].as_ref(), outputs)
            .await
    }
}

/// Wait until a lease taken with [`CRASH_LEASE_TTL`] has lapsed.
pub async fn wait_for_lease_expiry() {
    tokio::time::sleep(CRASH_LEASE_TTL + Duration::from_millis(100)).await;
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

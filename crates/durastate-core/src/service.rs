// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submission API: submit, get, cancel and list workflow instances.
//!
//! Submissions are persisted before they are dispatched, so an accepted
//! instance survives a crash even if no worker has started it yet. Runs execute
//! on their own tasks, bounded by the worker pool semaphore; callers observe
//! completion by polling [`WorkflowService::get`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::model::{InstanceStatus, InstanceSummary, WorkflowInstance, WorkflowName, WorkflowView};
use crate::orchestrator::Orchestrator;
use crate::workflow::validate_input;

/// Default page size for [`WorkflowService::list`].
pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Instance id (caller supplied or generated).
    pub id: String,
    /// Status at the time of the receipt.
    pub status: InstanceStatus,
    /// `false` when the id already existed and the stored instance was returned.
    pub created: bool,
}

/// Entry point for callers of the engine.
#[derive(Clone)]
pub struct WorkflowService {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl WorkflowService {
    /// Create a service dispatching runs through `orchestrator`, at most
    /// `permits` at a time.
    pub fn new(orchestrator: Arc<Orchestrator>, permits: Arc<Semaphore>) -> Self {
        Self {
            orchestrator,
            permits,
            tasks: TaskTracker::new(),
        }
    }

    /// The orchestrator runs are dispatched to.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Persist a new instance and start it in the background.
    ///
    /// Idempotent on `id`: resubmitting an existing id starts nothing and
    /// returns the stored status. Without an id a UUID v4 is generated.
    #[instrument(skip(self, input))]
    pub async fn submit(
        &self,
        workflow_name: &str,
        input: Value,
        id: Option<String>,
    ) -> Result<SubmitReceipt> {
        let name = WorkflowName::parse(workflow_name)?;
        validate_input(name, &input)?;
        self.orchestrator.catalog().get(name)?;

        let id = match id {
            Some(id) if id.trim().is_empty() => {
                return Err(EngineError::Validation {
                    field: "id".to_string(),
                    message: "id must not be empty".to_string(),
                });
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        let instance = WorkflowInstance::new(&id, name, input);
        let store = self.orchestrator.store();
        if !store.create_instance(&instance).await? {
            let existing = store
                .get_instance(&id)
                .await?
                .ok_or_else(|| EngineError::InstanceNotFound {
                    instance_id: id.clone(),
                })?;
            debug!(instance_id = %id, status = %existing.status, "Instance already submitted");
            return Ok(SubmitReceipt {
                id,
                status: existing.status,
                created: false,
            });
        }

        info!(instance_id = %id, workflow = %name, "Instance submitted");
        self.dispatch(id.clone());

        Ok(SubmitReceipt {
            id,
            status: InstanceStatus::Pending,
            created: true,
        })
    }

    /// Current status with output or failure.
    pub async fn get(&self, instance_id: &str) -> Result<WorkflowView> {
        self.orchestrator
            .store()
            .get_instance(instance_id)
            .await?
            .map(WorkflowView::from)
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// Request cancellation. Takes effect at the next step boundary; a no-op
    /// for instances already compensating or terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: &str) -> Result<WorkflowView> {
        if self.orchestrator.store().request_cancel(instance_id).await? {
            info!("Cancellation requested");
        }
        self.get(instance_id).await
    }

    /// Page through instances, newest first.
    pub async fn list(
        &self,
        status: Option<InstanceStatus>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<InstanceSummary>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1000);
        let offset = offset.unwrap_or(0).max(0);
        self.orchestrator
            .store()
            .list_instances(status, limit, offset)
            .await
    }

    /// Database liveness.
    pub async fn health(&self) -> Result<bool> {
        self.orchestrator.store().health_check().await
    }

    /// Run `instance_id` on a pool task.
    pub fn dispatch(&self, instance_id: String) {
        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(instance_id = %instance_id, "Worker pool closed, leaving instance for recovery");
                return;
            };
            match orchestrator.run(&instance_id).await {
                Ok(view) => debug!(instance_id = %instance_id, status = %view.status, "Dispatched run finished"),
                Err(EngineError::LeaseHeld { holder_id, .. }) => {
                    debug!(instance_id = %instance_id, holder_id = %holder_id, "Instance already leased")
                }
                Err(e) => warn!(instance_id = %instance_id, error = %e, "Dispatched run stopped"),
            }
        });
    }

    /// Number of runs currently dispatched by this service.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting dispatches and wait for in-flight runs.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

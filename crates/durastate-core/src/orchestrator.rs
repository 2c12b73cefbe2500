// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow orchestrator: drives one instance from its first incomplete step
//! to a terminal status.
//!
//! `run` is the single entry point for fresh submissions and recovery alike.
//! Everything it needs is reloaded from the store, so a run on a new worker
//! after a crash continues exactly where the previous holder's last checkpoint
//! left off.
//!
//! ```text
//! acquire lease ─▶ terminal? ─▶ return stored view
//!        │
//!        ▼
//!   for each incomplete step:
//!     boundary check (lease lost? cancelling?)
//!     execute ─▶ transient & attempts left ─▶ backoff, retry
//!        │
//!        ├─ all done ─────────────▶ COMPLETED
//!        └─ failed / cancelled ───▶ armed? ─▶ COMPENSATING ─▶ COMPENSATED | FAILED
//!                                     └─────────────────────▶ FAILED
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::StepAdapter;
use crate::compensation::{Compensation, with_compensation_error};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionContext, StepExecutor};
use crate::lease::{LeaseManager, RenewalHandle};
use crate::model::{FailureInfo, InstanceStatus, StepRecord, WorkflowInstance, WorkflowView};
use crate::persistence::{CheckpointStore, StatusUpdate};
use crate::workflow::{WorkflowCatalog, WorkflowDefinition};

/// Outcome of driving one step through its retry budget.
enum Attempt {
    Done(Value),
    Failed(FailureInfo),
}

/// Drives instances through their workflow definitions.
pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    catalog: Arc<WorkflowCatalog>,
    executor: StepExecutor,
    leases: Arc<LeaseManager>,
    config: EngineConfig,
}

impl Orchestrator {
    /// Create an orchestrator. The step timeout and retry policy come from `config`.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        catalog: Arc<WorkflowCatalog>,
        leases: Arc<LeaseManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor: StepExecutor::new(store.clone(), config.step_timeout),
            store,
            catalog,
            leases,
            config,
        }
    }

    /// The checkpoint store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// The lease manager.
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// The workflow catalog.
    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.catalog
    }

    /// Run (or continue) an instance to a terminal status.
    ///
    /// Fails fast with [`EngineError::LeaseHeld`] if another worker owns the
    /// instance, and stops with [`EngineError::LeaseLost`] if this worker's
    /// lease lapses mid-run. Step failures are not errors here: they end in a
    /// `FAILED` or `COMPENSATED` view.
    #[instrument(skip(self), fields(worker = %self.leases.holder_id()))]
    pub async fn run(&self, instance_id: &str) -> Result<WorkflowView> {
        let Some(lease) = self.leases.acquire(instance_id).await? else {
            let instance = self.load(instance_id).await?;
            return Err(EngineError::LeaseHeld {
                instance_id: instance_id.to_string(),
                holder_id: instance
                    .lease
                    .map(|l| l.holder_id)
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        };

        let renewal = self.leases.spawn_renewal(lease);
        let result = self.drive(instance_id, &renewal).await;

        let lease = renewal.stop().await;
        if let Err(e) = self.leases.release(&lease).await {
            warn!(error = %e, "Failed to release lease");
        }

        match &result {
            Ok(view) => info!(status = %view.status, "Run finished"),
            Err(e) => warn!(error = %e, code = e.error_code(), "Run stopped"),
        }
        result
    }

    async fn drive(&self, instance_id: &str, renewal: &RenewalHandle) -> Result<WorkflowView> {
        let instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            debug!(status = %instance.status, "Instance already terminal");
            return Ok(instance.into());
        }

        let definition = self.catalog.get(instance.workflow_name)?;
        let ctx = ExecutionContext {
            instance_id: instance.id.clone(),
            holder_id: self.leases.holder_id().to_string(),
            input: instance.input.clone(),
        };

        let failure = match instance.status {
            InstanceStatus::Compensating => {
                info!("Resuming compensation");
                let failure = instance.error.clone().unwrap_or_else(|| FailureInfo {
                    step: "unknown".to_string(),
                    index: definition.step_count(),
                    cause: "compensation resumed without a recorded failure".to_string(),
                    retryable: false,
                    compensation_error: None,
                });
                return self.compensate(&ctx, &definition, failure, renewal).await;
            }
            InstanceStatus::Pending => {
                self.store
                    .set_status(
                        &ctx.instance_id,
                        &ctx.holder_id,
                        &StatusUpdate::status(InstanceStatus::Running),
                    )
                    .await?;
                info!(workflow = %definition.name, "Instance running");
                self.run_forward(&ctx, &definition, &instance, renewal)
                    .await?
            }
            _ => {
                info!(workflow = %definition.name, status = %instance.status, "Continuing instance");
                self.run_forward(&ctx, &definition, &instance, renewal)
                    .await?
            }
        };

        match failure {
            None => self.complete(&ctx, &definition).await,
            Some(failure) => self.fail(&ctx, &definition, failure, renewal).await,
        }
    }

    /// Execute forward steps from the first incomplete index. Returns the
    /// failure (or cancellation) that stopped the sequence, if any.
    async fn run_forward(
        &self,
        ctx: &ExecutionContext,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        renewal: &RenewalHandle,
    ) -> Result<Option<FailureInfo>> {
        let step_count = definition.step_count();
        let start = instance.first_incomplete(step_count);
        let mut outputs = instance.outputs_before(start);
        if start > 0 {
            debug!(start, "Skipping completed checkpoints");
        }

        for index in start..step_count {
            if let Some(cancelled) = self.check_boundary(ctx, index, renewal).await? {
                return Ok(Some(cancelled));
            }

            let step = definition.steps[index].as_ref();
            match self
                .attempt(ctx, index, step, &outputs, renewal, true)
                .await?
            {
                Attempt::Done(output) => outputs.push(output),
                Attempt::Failed(failure) => return Ok(Some(failure)),
            }
        }

        Ok(None)
    }

    /// Execute one step, retrying transient failures within the persisted
    /// attempt budget.
    async fn attempt(
        &self,
        ctx: &ExecutionContext,
        index: usize,
        step: &dyn StepAdapter,
        prior_outputs: &[Value],
        renewal: &RenewalHandle,
        cancellable: bool,
    ) -> Result<Attempt> {
        loop {
            // A checkpointed permanent failure is final, and attempts
            // interrupted by earlier crashes count against the budget.
            if let Some(record) = self.record(ctx, index).await?
                && !record.is_completed()
                && (record.is_permanently_failed()
                    || record.attempt_count >= self.config.max_step_attempts)
            {
                warn!(
                    step = step.name(),
                    index,
                    attempts = record.attempt_count,
                    permanent = record.is_permanently_failed(),
                    "Step not retried after restart"
                );
                return Ok(Attempt::Failed(FailureInfo {
                    step: step.name().to_string(),
                    index,
                    cause: record.error.unwrap_or_else(|| {
                        format!("interrupted after {} attempts", record.attempt_count)
                    }),
                    retryable: record.retryable.unwrap_or(false),
                    compensation_error: None,
                }));
            }

            match self.executor.execute(ctx, index, step, prior_outputs).await {
                Ok(output) => return Ok(Attempt::Done(output)),
                Err(EngineError::StepFailed {
                    step: name,
                    index,
                    cause,
                    retryable,
                }) => {
                    let attempts = self
                        .record(ctx, index)
                        .await?
                        .map(|r| r.attempt_count)
                        .unwrap_or(0);

                    if !retryable || attempts >= self.config.max_step_attempts {
                        return Ok(Attempt::Failed(FailureInfo {
                            step: name,
                            index,
                            cause,
                            retryable,
                            compensation_error: None,
                        }));
                    }

                    let delay = self.config.backoff_for(attempts);
                    warn!(
                        step = %name,
                        index,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying step after transient failure"
                    );
                    tokio::time::sleep(delay).await;

                    if renewal.is_lost() {
                        return Err(self.lease_lost(ctx));
                    }
                    if cancellable && let Some(cancelled) = self.cancellation(ctx, index).await? {
                        return Ok(Attempt::Failed(cancelled));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn complete(
        &self,
        ctx: &ExecutionContext,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowView> {
        let instance = self.load(&ctx.instance_id).await?;
        let outputs = instance.outputs_before(definition.step_count());
        let output = (definition.assemble)(&outputs);

        self.store
            .set_status(
                &ctx.instance_id,
                &ctx.holder_id,
                &StatusUpdate::completed(output),
            )
            .await?;
        info!("Instance completed");
        self.view(ctx).await
    }

    async fn fail(
        &self,
        ctx: &ExecutionContext,
        definition: &WorkflowDefinition,
        failure: FailureInfo,
        renewal: &RenewalHandle,
    ) -> Result<WorkflowView> {
        let instance = self.load(&ctx.instance_id).await?;

        match &definition.compensation {
            Some(compensation) if compensation.is_armed(&instance) => {
                warn!(
                    step = %failure.step,
                    cause = %failure.cause,
                    compensation = compensation.step.name(),
                    "Step failed, compensating"
                );
                self.store
                    .set_status(
                        &ctx.instance_id,
                        &ctx.holder_id,
                        &StatusUpdate::failure(InstanceStatus::Compensating, failure.clone()),
                    )
                    .await?;
                self.compensate(ctx, definition, failure, renewal).await
            }
            _ => {
                warn!(step = %failure.step, cause = %failure.cause, "Step failed");
                self.store
                    .set_status(
                        &ctx.instance_id,
                        &ctx.holder_id,
                        &StatusUpdate::failure(InstanceStatus::Failed, failure),
                    )
                    .await?;
                self.view(ctx).await
            }
        }
    }

    /// Run the compensating step for an instance already in `COMPENSATING`.
    async fn compensate(
        &self,
        ctx: &ExecutionContext,
        definition: &WorkflowDefinition,
        failure: FailureInfo,
        renewal: &RenewalHandle,
    ) -> Result<WorkflowView> {
        let Some(compensation) = &definition.compensation else {
            self.store
                .set_status(
                    &ctx.instance_id,
                    &ctx.holder_id,
                    &StatusUpdate::failure(InstanceStatus::Failed, failure),
                )
                .await?;
            return self.view(ctx).await;
        };
        if renewal.is_lost() {
            return Err(self.lease_lost(ctx));
        }

        let index = Compensation::index(definition.step_count());
        let prior_outputs = self
            .load(&ctx.instance_id)
            .await?
            .outputs_before(definition.step_count());

        let update = match self
            .attempt(
                ctx,
                index,
                compensation.step.as_ref(),
                &prior_outputs,
                renewal,
                false,
            )
            .await?
        {
            Attempt::Done(_) => {
                info!(compensation = compensation.step.name(), "Instance compensated");
                StatusUpdate::failure(InstanceStatus::Compensated, failure)
            }
            Attempt::Failed(compensation_failure) => {
                error!(
                    step = %failure.step,
                    cause = %failure.cause,
                    compensation = compensation.step.name(),
                    compensation_cause = %compensation_failure.cause,
                    "Compensation failed, remote resource needs attention"
                );
                StatusUpdate::failure(
                    InstanceStatus::Failed,
                    with_compensation_error(failure, compensation_failure.cause),
                )
            }
        };

        self.store
            .set_status(&ctx.instance_id, &ctx.holder_id, &update)
            .await?;
        self.view(ctx).await
    }

    /// Lease health and cancellation at a step boundary.
    async fn check_boundary(
        &self,
        ctx: &ExecutionContext,
        index: usize,
        renewal: &RenewalHandle,
    ) -> Result<Option<FailureInfo>> {
        if renewal.is_lost() {
            return Err(self.lease_lost(ctx));
        }
        self.cancellation(ctx, index).await
    }

    async fn cancellation(&self, ctx: &ExecutionContext, index: usize) -> Result<Option<FailureInfo>> {
        match self.store.get_status(&ctx.instance_id).await? {
            None => Err(EngineError::InstanceNotFound {
                instance_id: ctx.instance_id.clone(),
            }),
            Some(InstanceStatus::Cancelling) => {
                info!(index, "Cancellation observed");
                Ok(Some(FailureInfo {
                    step: "cancelled".to_string(),
                    index,
                    cause: "cancellation requested".to_string(),
                    retryable: false,
                    compensation_error: None,
                }))
            }
            Some(_) => Ok(None),
        }
    }

    async fn record(&self, ctx: &ExecutionContext, index: usize) -> Result<Option<StepRecord>> {
        Ok(self.load(&ctx.instance_id).await?.step(index).cloned())
    }

    async fn load(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    async fn view(&self, ctx: &ExecutionContext) -> Result<WorkflowView> {
        Ok(self.load(&ctx.instance_id).await?.into())
    }

    fn lease_lost(&self, ctx: &ExecutionContext) -> EngineError {
        EngineError::LeaseLost {
            instance_id: ctx.instance_id.clone(),
            holder_id: ctx.holder_id.clone(),
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step executor: one attempt, one checkpoint transition.
//!
//! A completed checkpoint at the requested index is returned as-is without
//! invoking the adapter. Otherwise the step is marked running (with the attempt
//! counted) before the side effect, and its outcome is checkpointed before the
//! executor returns. Retries are the orchestrator's decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::adapter::StepAdapter;
use crate::error::{EngineError, Result, StepError};
use crate::model::{StepRecord, StepStatus};
use crate::persistence::CheckpointStore;

/// Identity of the run a step belongs to.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Instance being executed.
    pub instance_id: String,
    /// Lease holder writing the checkpoints.
    pub holder_id: String,
    /// Instance input handed to every step.
    pub input: Value,
}

/// Runs single steps against the checkpoint store.
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn CheckpointStore>,
    step_timeout: Duration,
}

impl StepExecutor {
    /// Create an executor bounding each invocation by `step_timeout`.
    pub fn new(store: Arc<dyn CheckpointStore>, step_timeout: Duration) -> Self {
        Self {
            store,
            step_timeout,
        }
    }

    /// Execute (or replay) the step at `index`.
    ///
    /// Returns the step output, or [`EngineError::StepFailed`] after the failed
    /// attempt is checkpointed. Store errors (including
    /// [`EngineError::LeaseLost`]) are returned without invoking the adapter
    /// when they happen before the side effect.
    #[instrument(skip(self, ctx, step, prior_outputs), fields(instance_id = %ctx.instance_id, step = %step.name()))]
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        index: usize,
        step: &dyn StepAdapter,
        prior_outputs: &[Value],
    ) -> Result<Value> {
        let instance = self
            .store
            .get_instance(&ctx.instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: ctx.instance_id.clone(),
            })?;

        let existing = instance.step(index).cloned();
        if let Some(record) = existing.as_ref().filter(|r| r.is_completed()) {
            debug!("Found completed checkpoint - replaying stored output");
            return Ok(record.output.clone().unwrap_or(Value::Null));
        }

        let mut record = existing.unwrap_or_else(|| StepRecord::pending(index, step.name()));
        record.name = step.name().to_string();
        record.status = StepStatus::Running;
        record.attempt_count += 1;
        record.output = None;
        record.error = None;
        record.retryable = None;
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        self.checkpoint(ctx, &record).await?;

        debug!(attempt = record.attempt_count, "Invoking step");
        let outcome = match tokio::time::timeout(
            self.step_timeout,
            step.invoke(&ctx.input, prior_outputs),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(StepError::Transient(format!(
                "timed out after {}s",
                self.step_timeout.as_secs_f64()
            ))),
        };

        record.finished_at = Some(Utc::now());
        match outcome {
            Ok(output) => {
                record.status = StepStatus::Completed;
                record.output = Some(output.clone());
                self.checkpoint(ctx, &record).await?;
                debug!(attempt = record.attempt_count, "Step completed");
                Ok(output)
            }
            Err(step_error) => {
                warn!(
                    attempt = record.attempt_count,
                    retryable = step_error.is_retryable(),
                    error = %step_error,
                    "Step attempt failed"
                );
                record.status = StepStatus::Failed;
                record.error = Some(step_error.to_string());
                record.retryable = Some(step_error.is_retryable());
                self.checkpoint(ctx, &record).await?;
                Err(EngineError::StepFailed {
                    step: record.name,
                    index,
                    cause: step_error.to_string(),
                    retryable: step_error.is_retryable(),
                })
            }
        }
    }

    async fn checkpoint(&self, ctx: &ExecutionContext, record: &StepRecord) -> Result<()> {
        let result = self
            .store
            .append_or_update_step(&ctx.instance_id, &ctx.holder_id, record)
            .await;
        if let Err(EngineError::Conflict { index, .. }) = &result {
            error!(
                instance_id = %ctx.instance_id,
                index,
                "Completed checkpoint would be overwritten with a different result"
            );
        }
        result
    }
}

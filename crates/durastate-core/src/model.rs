// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow instance, step, and lease records.
//!
//! These are the durable shapes the engine reads and writes through the
//! [`CheckpointStore`](crate::persistence::CheckpointStore). Everything the
//! orchestrator needs to resume an instance is derivable from a
//! [`WorkflowInstance`] loaded by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Closed set of workflow definitions the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowName {
    /// Read the current connection state.
    GetState,
    /// Pause, replace state, resume, and verify a connection.
    UpdateState,
}

impl WorkflowName {
    /// Every known workflow.
    pub const ALL: [WorkflowName; 2] = [WorkflowName::GetState, WorkflowName::UpdateState];

    /// Returns the persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetState => "GetState",
            Self::UpdateState => "UpdateState",
        }
    }

    /// Parse a persisted or submitted workflow name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "GetState" => Ok(Self::GetState),
            "UpdateState" => Ok(Self::UpdateState),
            other => Err(EngineError::UnknownWorkflow {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a workflow instance.
///
/// ```text
/// PENDING → RUNNING ──────────────────────────→ COMPLETED
///              │ └──→ CANCELLING ──┐
///              │ step failed       ▼
///              ├─────────────→ COMPENSATING → COMPENSATED | FAILED
///              └─ (no compensation armed) ──→ FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// A lease holder is executing forward steps.
    Running,
    /// Cancellation requested; observed at the next step boundary.
    Cancelling,
    /// A forward step failed (or the run was cancelled) and the compensating step is running.
    Compensating,
    /// All forward steps completed.
    Completed,
    /// Failed without compensation, or compensation itself failed.
    Failed,
    /// Failed and successfully compensated.
    Compensated,
}

impl InstanceStatus {
    /// Returns the persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        }
    }

    /// Parse a persisted status.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "compensating" => Ok(Self::Compensating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "compensated" => Ok(Self::Compensated),
            other => Err(EngineError::Validation {
                field: "status".to_string(),
                message: format!("unknown instance status '{}'", other),
            }),
        }
    }

    /// Terminal instances are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Compensated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not attempted yet.
    Pending,
    /// Invocation in flight (or interrupted by a crash).
    Running,
    /// Output checkpointed; never invoked again.
    Completed,
    /// Last attempt failed.
    Failed,
}

impl StepStatus {
    /// Returns the persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a persisted step status.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Validation {
                field: "step_status".to_string(),
                message: format!("unknown step status '{}'", other),
            }),
        }
    }
}

/// Durable record of one step position within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position in the workflow definition (the compensating step uses the
    /// index right after the last forward step).
    pub index: usize,
    /// Step name, for diagnostics.
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Output persisted on success and replayed on recovery.
    pub output: Option<Value>,
    /// Cause of the last failed attempt.
    pub error: Option<String>,
    /// Classification of the last failed attempt. `Some(false)` means the
    /// failure was permanent and the step is never invoked again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Number of times execution was (re)attempted.
    pub attempt_count: u32,
    /// When the last attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the last attempt finished.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A fresh, never attempted record.
    pub fn pending(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            retryable: None,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether the output is checkpointed.
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Whether the last attempt failed permanently.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == StepStatus::Failed && self.retryable == Some(false)
    }
}

/// Structured failure surfaced on failed or compensated instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Name of the step that failed (or `"cancelled"` for cancellations).
    pub step: String,
    /// Index of that step.
    pub index: usize,
    /// Human readable cause.
    pub cause: String,
    /// Whether the last failure was classified as transient.
    pub retryable: bool,
    /// Cause of the compensation failure, when compensation also failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<String>,
}

/// Time-bounded ownership of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased instance.
    pub instance_id: String,
    /// Worker holding the lease.
    pub holder_id: String,
    /// Instant after which any worker may take over.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease is still valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// One execution attempt of a named step sequence against concrete input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Primary key.
    pub id: String,
    /// Which definition to run.
    pub workflow_name: WorkflowName,
    /// Immutable input captured at creation.
    pub input: Value,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Step records ordered by index.
    pub steps: Vec<StepRecord>,
    /// Result assembled from step outputs on completion.
    pub output: Option<Value>,
    /// Failure details on failed, compensating, or compensated instances.
    pub error: Option<FailureInfo>,
    /// Current lease, if any (valid or expired).
    pub lease: Option<Lease>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When a terminal status was reached.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Build a new pending instance.
    pub fn new(id: impl Into<String>, workflow_name: WorkflowName, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workflow_name,
            input,
            status: InstanceStatus::Pending,
            steps: Vec::new(),
            output: None,
            error: None,
            lease: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Step record at `index`, if one was ever written.
    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.index == index)
    }

    /// First index in `0..step_count` without a completed record.
    pub fn first_incomplete(&self, step_count: usize) -> usize {
        (0..step_count)
            .find(|i| !self.step(*i).is_some_and(StepRecord::is_completed))
            .unwrap_or(step_count)
    }

    /// Outputs of the completed steps before `index`, in order.
    pub fn outputs_before(&self, index: usize) -> Vec<Value> {
        (0..index)
            .filter_map(|i| self.step(i).and_then(|s| s.output.clone()))
            .collect()
    }
}

/// What callers see of an instance: status plus output or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowView {
    /// Instance id.
    pub id: String,
    /// Definition name.
    pub workflow_name: WorkflowName,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Output on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    /// Step records in index order.
    pub steps: Vec<StepRecord>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Terminal time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowView {
    /// The failure as an engine error, if the instance failed or was compensated.
    pub fn engine_error(&self) -> Option<EngineError> {
        let failure = self.error.as_ref()?;
        Some(match &failure.compensation_error {
            Some(compensation) => EngineError::CompensationFailed {
                step: failure.step.clone(),
                original: failure.cause.clone(),
                // The compensating step checkpoints under the highest index.
                compensation_step: self
                    .steps
                    .last()
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                compensation: compensation.clone(),
            },
            None => EngineError::StepFailed {
                step: failure.step.clone(),
                index: failure.index,
                cause: failure.cause.clone(),
                retryable: failure.retryable,
            },
        })
    }
}

impl From<WorkflowInstance> for WorkflowView {
    fn from(instance: WorkflowInstance) -> Self {
        Self {
            id: instance.id,
            workflow_name: instance.workflow_name,
            status: instance.status,
            output: instance.output,
            error: instance.error,
            steps: instance.steps,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            finished_at: instance.finished_at,
        }
    }
}

/// Lightweight listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// Instance id.
    pub id: String,
    /// Definition name.
    pub workflow_name: WorkflowName,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Input of the connection-state workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInput {
    /// Remote resource (connection) identifier.
    pub resource_id: String,
    /// Desired state for `UpdateState`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<Value>,
}

impl ConnectionInput {
    /// Decode and validate workflow input.
    pub fn from_value(value: &Value) -> Result<Self> {
        let input: ConnectionInput =
            serde_json::from_value(value.clone()).map_err(|e| EngineError::Validation {
                field: "input".to_string(),
                message: e.to_string(),
            })?;
        if input.resource_id.trim().is_empty() {
            return Err(EngineError::Validation {
                field: "resource_id".to_string(),
                message: "resource_id is required".to_string(),
            });
        }
        Ok(input)
    }
}

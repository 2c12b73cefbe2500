// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint store interface and backends.
//!
//! The store is the single source of truth for what has already happened.
//! Every mutation is scoped to one instance row (plus its step rows) and is a
//! single atomic statement or transaction; there is no cross-instance
//! locking. Writes that transition a step or the instance status are fenced on
//! the caller's lease.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::model::{
    FailureInfo, InstanceStatus, InstanceSummary, Lease, StepRecord, StepStatus, WorkflowInstance,
    WorkflowName,
};

/// How long a store call waits for a pooled connection.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Instance row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    /// Primary key.
    pub instance_id: String,
    /// Workflow definition name.
    pub workflow_name: String,
    /// JSON input.
    pub input: String,
    /// Lifecycle status.
    pub status: String,
    /// JSON output on completion.
    pub output: Option<String>,
    /// JSON [`FailureInfo`].
    pub error: Option<String>,
    /// Current lease holder.
    pub lease_holder: Option<String>,
    /// Current lease expiry.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Terminal time.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Step row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRow {
    /// Owning instance.
    pub instance_id: String,
    /// Position in the definition.
    pub step_index: i64,
    /// Step name.
    pub step_name: String,
    /// Step status.
    pub status: String,
    /// JSON output.
    pub output: Option<String>,
    /// Last failure cause.
    pub error: Option<String>,
    /// Last failure classification.
    pub retryable: Option<bool>,
    /// Attempts so far.
    pub attempt_count: i64,
    /// Last attempt start.
    pub started_at: Option<DateTime<Utc>>,
    /// Last attempt end.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRow {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            index: usize::try_from(self.step_index).map_err(|_| EngineError::Validation {
                field: "step_index".to_string(),
                message: format!("negative step index {}", self.step_index),
            })?,
            name: self.step_name,
            status: StepStatus::parse(&self.status)?,
            output: decode_json(self.output.as_deref())?,
            error: self.error,
            retryable: self.retryable,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(u32::MAX),
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

impl InstanceRow {
    /// Assemble the domain record from the instance row and its step rows.
    pub fn into_instance(self, steps: Vec<StepRow>) -> Result<WorkflowInstance> {
        let mut records = steps
            .into_iter()
            .map(StepRow::into_record)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|s| s.index);

        let lease = match (self.lease_holder, self.lease_expires_at) {
            (Some(holder_id), Some(expires_at)) => Some(Lease {
                instance_id: self.instance_id.clone(),
                holder_id,
                expires_at,
            }),
            _ => None,
        };

        let error: Option<FailureInfo> = match self.error.as_deref() {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };

        Ok(WorkflowInstance {
            id: self.instance_id,
            workflow_name: WorkflowName::parse(&self.workflow_name)?,
            input: serde_json::from_str(&self.input)?,
            status: InstanceStatus::parse(&self.status)?,
            steps: records,
            output: decode_json(self.output.as_deref())?,
            error,
            lease,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }

    fn into_summary(self) -> Result<InstanceSummary> {
        Ok(InstanceSummary {
            id: self.instance_id,
            workflow_name: WorkflowName::parse(&self.workflow_name)?,
            status: InstanceStatus::parse(&self.status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn decode_json(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(EngineError::from)
}

fn encode_json(value: Option<&Value>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(EngineError::from)
}

/// Status transition written by the lease holder.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// New status.
    pub status: InstanceStatus,
    /// Output to store (completion only).
    pub output: Option<Value>,
    /// Failure to store; `None` clears it.
    pub error: Option<FailureInfo>,
}

impl StatusUpdate {
    /// Transition without output or failure.
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
        }
    }

    /// Transition carrying a failure.
    pub fn failure(status: InstanceStatus, error: FailureInfo) -> Self {
        Self {
            status,
            output: None,
            error: Some(error),
        }
    }

    /// Successful completion.
    pub fn completed(output: Value) -> Self {
        Self {
            status: InstanceStatus::Completed,
            output: Some(output),
            error: None,
        }
    }
}

/// Persistence interface used by the executor, orchestrator, and recovery.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert a new instance. Returns `false` (and changes nothing) if the id
    /// already exists.
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<bool>;

    /// Load an instance with all its step records.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>>;

    /// Current status only, for step-boundary cancellation checks.
    async fn get_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>>;

    /// Insert or update the step record at `record.index`.
    ///
    /// Fails with [`EngineError::LeaseLost`] unless `holder_id` holds a valid
    /// lease, and with [`EngineError::Conflict`] if the index is already
    /// completed with a different output. Rewriting a completed step with the
    /// identical output is a no-op.
    async fn append_or_update_step(
        &self,
        instance_id: &str,
        holder_id: &str,
        record: &StepRecord,
    ) -> Result<()>;

    /// Transition the instance status. Fenced on the lease. Terminal instances
    /// are never modified, and a pending cancellation is never overwritten by
    /// `running`; both cases are silent no-ops.
    async fn set_status(
        &self,
        instance_id: &str,
        holder_id: &str,
        update: &StatusUpdate,
    ) -> Result<()>;

    /// Ids of every non-terminal instance.
    async fn list_non_terminal(&self) -> Result<Vec<String>>;

    /// Ids of non-terminal instances whose lease is absent or expired at `now`,
    /// oldest first.
    async fn list_recoverable(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>>;

    /// Listing for operators.
    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceSummary>>;

    /// Take the lease if it is absent or expired. `None` if another holder's
    /// lease is valid or the instance does not exist.
    async fn acquire_lease(
        &self,
        instance_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Extend a still-valid lease. `None` if it expired or changed hands.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>>;

    /// Drop the lease if still held by `lease.holder_id`.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Mark a pending or running instance as cancelling. Returns whether the
    /// request was applied.
    async fn request_cancel(&self, instance_id: &str) -> Result<bool>;

    /// Liveness of the backing database.
    async fn health_check(&self) -> Result<bool>;
}

/// Open a store for `database_url`, picking the backend from the scheme, and
/// run its migrations.
pub async fn connect(database_url: &str) -> Result<Arc<dyn CheckpointStore>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::connect(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    } else {
        Err(EngineError::Validation {
            field: "database_url".to_string(),
            message: "expected a sqlite: or postgres:// URL".to_string(),
        })
    }
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| EngineError::Validation {
        field: "lease_ttl".to_string(),
        message: e.to_string(),
    })?;
    Ok(now + ttl)
}

/// Decide why a fenced step write touched no rows.
pub(crate) fn diagnose_step_write(
    instance_id: &str,
    holder_id: &str,
    record: &StepRecord,
    instance: Option<&InstanceRow>,
    existing: Option<StepRow>,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(instance) = instance else {
        return Err(EngineError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        });
    };
    let lease_valid = instance.lease_holder.as_deref() == Some(holder_id)
        && instance.lease_expires_at.is_some_and(|at| at > now);
    if !lease_valid {
        return Err(EngineError::LeaseLost {
            instance_id: instance_id.to_string(),
            holder_id: holder_id.to_string(),
        });
    }

    if let Some(existing) = existing {
        let existing = existing.into_record()?;
        if existing.is_completed() {
            if record.is_completed() && existing.output == record.output {
                return Ok(());
            }
            return Err(EngineError::Conflict {
                instance_id: instance_id.to_string(),
                index: record.index,
            });
        }
    }

    Err(EngineError::database(
        "append_or_update_step",
        "write affected no rows",
    ))
}

/// Decide why a fenced status write touched no rows.
pub(crate) fn diagnose_status_write(
    instance_id: &str,
    holder_id: &str,
    instance: Option<&InstanceRow>,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(instance) = instance else {
        return Err(EngineError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        });
    };
    let lease_valid = instance.lease_holder.as_deref() == Some(holder_id)
        && instance.lease_expires_at.is_some_and(|at| at > now);
    if lease_valid {
        // Terminal or cancelling guard: nothing to do.
        Ok(())
    } else {
        Err(EngineError::LeaseLost {
            instance_id: instance_id.to_string(),
            holder_id: holder_id.to_string(),
        })
    }
}

pub(crate) struct EncodedStep {
    pub index: i64,
    pub output: Option<String>,
    pub attempt_count: i64,
}

pub(crate) fn encode_step(record: &StepRecord) -> Result<EncodedStep> {
    Ok(EncodedStep {
        index: i64::try_from(record.index).map_err(|_| EngineError::Validation {
            field: "step_index".to_string(),
            message: "step index out of range".to_string(),
        })?,
        output: encode_json(record.output.as_ref())?,
        attempt_count: i64::from(record.attempt_count),
    })
}

pub(crate) struct EncodedStatus {
    pub output: Option<String>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub(crate) fn encode_status(update: &StatusUpdate, now: DateTime<Utc>) -> Result<EncodedStatus> {
    Ok(EncodedStatus {
        output: encode_json(update.output.as_ref())?,
        error: update
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        finished_at: update.status.is_terminal().then_some(now),
    })
}

pub(crate) fn summaries(rows: Vec<InstanceRow>) -> Result<Vec<InstanceSummary>> {
    rows.into_iter().map(InstanceRow::into_summary).collect()
}

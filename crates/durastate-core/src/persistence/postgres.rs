// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed checkpoint store.
//!
//! Query functions take the pool directly so the server can reuse them for
//! ad-hoc queries; [`PostgresStore`] wires them into [`CheckpointStore`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{EngineError, Result};
use crate::migrations;
use crate::model::{InstanceStatus, InstanceSummary, Lease, StepRecord, WorkflowInstance};

use super::{
    ACQUIRE_TIMEOUT, CheckpointStore, InstanceRow, StatusUpdate, StepRow, diagnose_status_write,
    diagnose_step_write, encode_status, encode_step, lease_expiry, summaries,
};

/// PostgreSQL-backed checkpoint store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| EngineError::database("connect", e))?;

        migrations::run_postgres(&pool)
            .await
            .map_err(|e| EngineError::database("migrate", e))?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Instance Operations
// ============================================================================

/// Insert an instance unless the id is taken.
pub async fn create_instance(pool: &PgPool, instance: &WorkflowInstance) -> Result<bool> {
    let input = serde_json::to_string(&instance.input)?;
    let result = sqlx::query(
        r#"
        INSERT INTO workflow_instances
            (instance_id, workflow_name, input, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (instance_id) DO NOTHING
        "#,
    )
    .bind(&instance.id)
    .bind(instance.workflow_name.as_str())
    .bind(input)
    .bind(instance.status.as_str())
    .bind(instance.created_at)
    .bind(instance.updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn fetch_instance_row(pool: &PgPool, instance_id: &str) -> Result<Option<InstanceRow>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT instance_id, workflow_name, input, status, output, error,
               lease_holder, lease_expires_at, created_at, updated_at, finished_at
        FROM workflow_instances
        WHERE instance_id = $1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

async fn fetch_step_rows(
    pool: &PgPool,
    instance_id: &str,
    index: Option<i64>,
) -> Result<Vec<StepRow>> {
    let rows = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT instance_id, step_index, step_name, status, output, error,
               attempt_count, started_at, finished_at, retryable
        FROM workflow_steps
        WHERE instance_id = $1 AND ($2::BIGINT IS NULL OR step_index = $2)
        ORDER BY step_index
        "#,
    )
    .bind(instance_id)
    .bind(index)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Load an instance with its steps.
pub async fn get_instance(pool: &PgPool, instance_id: &str) -> Result<Option<WorkflowInstance>> {
    let Some(row) = fetch_instance_row(pool, instance_id).await? else {
        return Ok(None);
    };
    let steps = fetch_step_rows(pool, instance_id, None).await?;
    row.into_instance(steps).map(Some)
}

/// Current status only.
pub async fn get_status(pool: &PgPool, instance_id: &str) -> Result<Option<InstanceStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM workflow_instances WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(pool)
            .await?;
    status.as_deref().map(InstanceStatus::parse).transpose()
}

/// Lease-fenced step upsert.
pub async fn append_or_update_step(
    pool: &PgPool,
    instance_id: &str,
    holder_id: &str,
    record: &StepRecord,
) -> Result<()> {
    let encoded = encode_step(record)?;
    let now = Utc::now();

    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        r#"
        INSERT INTO workflow_steps
            (instance_id, step_index, step_name, status, output, error,
             attempt_count, started_at, finished_at, retryable)
        SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $12
        WHERE EXISTS (
            SELECT 1 FROM workflow_instances
            WHERE instance_id = $1 AND lease_holder = $10 AND lease_expires_at > $11
        )
        ON CONFLICT (instance_id, step_index) DO UPDATE SET
            step_name = EXCLUDED.step_name,
            status = EXCLUDED.status,
            output = EXCLUDED.output,
            error = EXCLUDED.error,
            attempt_count = EXCLUDED.attempt_count,
            started_at = EXCLUDED.started_at,
            finished_at = EXCLUDED.finished_at,
            retryable = EXCLUDED.retryable
        WHERE workflow_steps.status <> 'completed'
        "#,
    )
    .bind(instance_id)
    .bind(encoded.index)
    .bind(&record.name)
    .bind(record.status.as_str())
    .bind(encoded.output)
    .bind(&record.error)
    .bind(encoded.attempt_count)
    .bind(record.started_at)
    .bind(record.finished_at)
    .bind(holder_id)
    .bind(now)
    .bind(record.retryable)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        let instance = fetch_instance_row(pool, instance_id).await?;
        let existing = fetch_step_rows(pool, instance_id, Some(encoded.index))
            .await?
            .into_iter()
            .next();
        return diagnose_step_write(
            instance_id,
            holder_id,
            record,
            instance.as_ref(),
            existing,
            now,
        );
    }

    sqlx::query("UPDATE workflow_instances SET updated_at = $1 WHERE instance_id = $2")
        .bind(now)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(())
}

/// Lease-fenced status transition.
pub async fn set_status(
    pool: &PgPool,
    instance_id: &str,
    holder_id: &str,
    update: &StatusUpdate,
) -> Result<()> {
    let now = Utc::now();
    let encoded = encode_status(update, now)?;

    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = $1, output = $2, error = $3, finished_at = $4, updated_at = $5
        WHERE instance_id = $6
          AND lease_holder = $7
          AND lease_expires_at > $5
          AND status NOT IN ('completed', 'failed', 'compensated')
          AND NOT (status = 'cancelling' AND $1 = 'running')
        "#,
    )
    .bind(update.status.as_str())
    .bind(encoded.output)
    .bind(encoded.error)
    .bind(encoded.finished_at)
    .bind(now)
    .bind(instance_id)
    .bind(holder_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let instance = fetch_instance_row(pool, instance_id).await?;
        return diagnose_status_write(instance_id, holder_id, instance.as_ref(), now);
    }

    Ok(())
}

/// Ids of every non-terminal instance, oldest first.
pub async fn list_non_terminal(pool: &PgPool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT instance_id FROM workflow_instances
        WHERE status IN ('pending', 'running', 'cancelling', 'compensating')
        ORDER BY created_at
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Ids of non-terminal, unleased instances, oldest first.
pub async fn list_recoverable(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT instance_id FROM workflow_instances
        WHERE status IN ('pending', 'running', 'cancelling', 'compensating')
          AND (lease_holder IS NULL OR lease_expires_at <= $1)
        ORDER BY created_at
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Paged listing, newest first.
pub async fn list_instances(
    pool: &PgPool,
    status: Option<InstanceStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<InstanceSummary>> {
    let rows = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT instance_id, workflow_name, input, status, output, error,
               lease_holder, lease_expires_at, created_at, updated_at, finished_at
        FROM workflow_instances
        WHERE ($1::TEXT IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    summaries(rows)
}

/// Request cancellation of a pending or running instance.
pub async fn request_cancel(pool: &PgPool, instance_id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = 'cancelling', updated_at = $1
        WHERE instance_id = $2 AND status IN ('pending', 'running')
        "#,
    )
    .bind(Utc::now())
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ============================================================================
// Lease Operations
// ============================================================================

/// Take an absent or expired lease.
pub async fn acquire_lease(
    pool: &PgPool,
    instance_id: &str,
    holder_id: &str,
    ttl: Duration,
) -> Result<Option<Lease>> {
    let now = Utc::now();
    let expires_at = lease_expiry(now, ttl)?;

    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET lease_holder = $1, lease_expires_at = $2
        WHERE instance_id = $3
          AND (lease_holder IS NULL OR lease_expires_at <= $4)
        "#,
    )
    .bind(holder_id)
    .bind(expires_at)
    .bind(instance_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok((result.rows_affected() == 1).then(|| Lease {
        instance_id: instance_id.to_string(),
        holder_id: holder_id.to_string(),
        expires_at,
    }))
}

/// Extend a still-valid lease.
pub async fn renew_lease(pool: &PgPool, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
    let now = Utc::now();
    let expires_at = lease_expiry(now, ttl)?;

    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET lease_expires_at = $1
        WHERE instance_id = $2 AND lease_holder = $3 AND lease_expires_at > $4
        "#,
    )
    .bind(expires_at)
    .bind(&lease.instance_id)
    .bind(&lease.holder_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok((result.rows_affected() == 1).then(|| Lease {
        expires_at,
        ..lease.clone()
    }))
}

/// Drop a lease still held by `lease.holder_id`.
pub async fn release_lease(pool: &PgPool, lease: &Lease) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE workflow_instances
        SET lease_holder = NULL, lease_expires_at = NULL
        WHERE instance_id = $1 AND lease_holder = $2
        "#,
    )
    .bind(&lease.instance_id)
    .bind(&lease.holder_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Persistence Trait Implementation
// ============================================================================

#[async_trait::async_trait]
impl CheckpointStore for PostgresStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<bool> {
        create_instance(&self.pool, instance).await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        get_instance(&self.pool, instance_id).await
    }

    async fn get_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>> {
        get_status(&self.pool, instance_id).await
    }

    async fn append_or_update_step(
        &self,
        instance_id: &str,
        holder_id: &str,
        record: &StepRecord,
    ) -> Result<()> {
        append_or_update_step(&self.pool, instance_id, holder_id, record).await
    }

    async fn set_status(
        &self,
        instance_id: &str,
        holder_id: &str,
        update: &StatusUpdate,
    ) -> Result<()> {
        set_status(&self.pool, instance_id, holder_id, update).await
    }

    async fn list_non_terminal(&self) -> Result<Vec<String>> {
        list_non_terminal(&self.pool).await
    }

    async fn list_recoverable(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>> {
        list_recoverable(&self.pool, now, limit).await
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceSummary>> {
        list_instances(&self.pool, status, limit, offset).await
    }

    async fn acquire_lease(
        &self,
        instance_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        acquire_lease(&self.pool, instance_id, holder_id, ttl).await
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        renew_lease(&self.pool, lease, ttl).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        release_lease(&self.pool, lease).await
    }

    async fn request_cancel(&self, instance_id: &str) -> Result<bool> {
        request_cancel(&self.pool, instance_id).await
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

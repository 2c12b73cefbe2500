// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed checkpoint store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::{EngineError, Result};
use crate::migrations;
use crate::model::{InstanceStatus, InstanceSummary, Lease, StepRecord, WorkflowInstance};

use super::{
    ACQUIRE_TIMEOUT, CheckpointStore, InstanceRow, StatusUpdate, StepRow, diagnose_status_write,
    diagnose_step_write, encode_status, encode_step, lease_expiry, summaries,
};

const INSTANCE_COLUMNS: &str = r#"
    instance_id, workflow_name, input, status, output, error,
    lease_holder, lease_expires_at, created_at, updated_at, finished_at
"#;

const STEP_COLUMNS: &str = r#"
    instance_id, step_index, step_name, status, output, error,
    attempt_count, started_at, finished_at, retryable
"#;

/// SQLite-backed checkpoint store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL, creating the database if missing, and run
    /// migrations. In-memory databases get a single connection so every query
    /// sees the same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| EngineError::database("connect", e))?
            .create_if_missing(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::database("connect", e))?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| EngineError::database("migrate", e))?;

        Ok(Self { pool })
    }

    /// Open (or create) a database file, creating parent directories as needed.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/durastate.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_instance_row(&self, instance_id: &str) -> Result<Option<InstanceRow>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE instance_id = ?"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn fetch_step_row(&self, instance_id: &str, index: i64) -> Result<Option<StepRow>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE instance_id = ? AND step_index = ?"
        ))
        .bind(instance_id)
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<bool> {
        let input = serde_json::to_string(&instance.input)?;
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (instance_id, workflow_name, input, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (instance_id) DO NOTHING
            "#,
        )
        .bind(&instance.id)
        .bind(instance.workflow_name.as_str())
        .bind(input)
        .bind(instance.status.as_str())
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        let Some(row) = self.fetch_instance_row(instance_id).await? else {
            return Ok(None);
        };

        let steps = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE instance_id = ? ORDER BY step_index"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        row.into_instance(steps).map(Some)
    }

    async fn get_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_instances WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        status.as_deref().map(InstanceStatus::parse).transpose()
    }

    async fn append_or_update_step(
        &self,
        instance_id: &str,
        holder_id: &str,
        record: &StepRecord,
    ) -> Result<()> {
        let encoded = encode_step(record)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (instance_id, step_index, step_name, status, output, error,
                 attempt_count, started_at, finished_at, retryable)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?12
            WHERE EXISTS (
                SELECT 1 FROM workflow_instances
                WHERE instance_id = ?1 AND lease_holder = ?10 AND lease_expires_at > ?11
            )
            ON CONFLICT (instance_id, step_index) DO UPDATE SET
                step_name = excluded.step_name,
                status = excluded.status,
                output = excluded.output,
                error = excluded.error,
                attempt_count = excluded.attempt_count,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                retryable = excluded.retryable
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
            let instance = self.fetch_instance_row(instance_id).await?;
            let existing = self.fetch_step_row(instance_id, encoded.index).await?;
            return diagnose_step_write(
                instance_id,
                holder_id,
                record,
                instance.as_ref(),
                existing,
                now,
            );
        }

        sqlx::query("UPDATE workflow_instances SET updated_at = ? WHERE instance_id = ?")
            .bind(now)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn set_status(
        &self,
        instance_id: &str,
        holder_id: &str,
        update: &StatusUpdate,
    ) -> Result<()> {
        let now = Utc::now();
        let encoded = encode_status(update, now)?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?1, output = ?2, error = ?3, finished_at = ?4, updated_at = ?5
            WHERE instance_id = ?6
              AND lease_holder = ?7
              AND lease_expires_at > ?5
              AND status NOT IN ('completed', 'failed', 'compensated')
              AND NOT (status = 'cancelling' AND ?1 = 'running')
            "#,
        )
        .bind(update.status.as_str())
        .bind(encoded.output)
        .bind(encoded.error)
        .bind(encoded.finished_at)
        .bind(now)
        .bind(instance_id)
        .bind(holder_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let instance = self.fetch_instance_row(instance_id).await?;
            return diagnose_status_write(instance_id, holder_id, instance.as_ref(), now);
        }

        Ok(())
    }

    async fn list_non_terminal(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT instance_id FROM workflow_instances
            WHERE status IN ('pending', 'running', 'cancelling', 'compensating')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_recoverable(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT instance_id FROM workflow_instances
            WHERE status IN ('pending', 'running', 'cancelling', 'compensating')
              AND (lease_holder IS NULL OR lease_expires_at <= ?)
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceSummary>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM workflow_instances
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC
            LIMIT ?2 OFFSET ?3
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        summaries(rows)
    }

    async fn acquire_lease(
        &self,
        instance_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl)?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_holder = ?, lease_expires_at = ?
            WHERE instance_id = ?
              AND (lease_holder IS NULL OR lease_expires_at <= ?)
            "#,
        )
        .bind(holder_id)
        .bind(expires_at)
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then(|| Lease {
            instance_id: instance_id.to_string(),
            holder_id: holder_id.to_string(),
            expires_at,
        }))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl)?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_expires_at = ?
            WHERE instance_id = ? AND lease_holder = ? AND lease_expires_at > ?
            "#,
        )
        .bind(expires_at)
        .bind(&lease.instance_id)
        .bind(&lease.holder_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then(|| Lease {
            expires_at,
            ..lease.clone()
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_holder = NULL, lease_expires_at = NULL
            WHERE instance_id = ? AND lease_holder = ?
            "#,
        )
        .bind(&lease.instance_id)
        .bind(&lease.holder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_cancel(&self, instance_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'cancelling', updated_at = ?
            WHERE instance_id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

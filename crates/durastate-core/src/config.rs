// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Lease holder identity of this worker
    pub worker_id: String,
    /// Lease time-to-live
    pub lease_ttl: Duration,
    /// How often the recovery sweep runs
    pub recovery_interval: Duration,
    /// Upper bound for a single step invocation
    pub step_timeout: Duration,
    /// Maximum attempts per step before the failure becomes terminal
    pub max_step_attempts: u32,
    /// Backoff before the first retry, doubled per attempt
    pub retry_backoff: Duration,
    /// Maximum concurrently running instances
    pub max_concurrent_instances: u32,
}

impl EngineConfig {
    /// Configuration with defaults for everything but the database URL.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            lease_ttl: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(15),
            step_timeout: Duration::from_secs(90),
            max_step_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            max_concurrent_instances: 32,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DURASTATE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `DURASTATE_WORKER_ID`: lease holder id (default: `worker-<uuid>`)
    /// - `DURASTATE_LEASE_TTL_SECS`: lease TTL (default: 30)
    /// - `DURASTATE_RECOVERY_INTERVAL_SECS`: sweep period (default: 15)
    /// - `DURASTATE_STEP_TIMEOUT_SECS`: per-step timeout (default: 90)
    /// - `DURASTATE_MAX_STEP_ATTEMPTS`: attempts per step (default: 3)
    /// - `DURASTATE_RETRY_BACKOFF_MS`: initial retry backoff (default: 500)
    /// - `DURASTATE_MAX_CONCURRENT_INSTANCES`: worker pool size (default: 32)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DURASTATE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DURASTATE_DATABASE_URL"))?;

        let mut config = Self::new(database_url);

        if let Ok(worker_id) = std::env::var("DURASTATE_WORKER_ID") {
            if worker_id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "DURASTATE_WORKER_ID",
                    "must not be empty",
                ));
            }
            config.worker_id = worker_id;
        }

        config.lease_ttl = Duration::from_secs(parse_positive(
            "DURASTATE_LEASE_TTL_SECS",
            30,
            "must be a positive number of seconds",
        )?);
        config.recovery_interval = Duration::from_secs(parse_positive(
            "DURASTATE_RECOVERY_INTERVAL_SECS",
            15,
            "must be a positive number of seconds",
        )?);
        config.step_timeout = Duration::from_secs(parse_positive(
            "DURASTATE_STEP_TIMEOUT_SECS",
            90,
            "must be a positive number of seconds",
        )?);
        config.max_step_attempts = parse_positive(
            "DURASTATE_MAX_STEP_ATTEMPTS",
            3,
            "must be a positive integer",
        )?;
        config.retry_backoff = Duration::from_millis(
            std::env::var("DURASTATE_RETRY_BACKOFF_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid("DURASTATE_RETRY_BACKOFF_MS", "must be a number")
                })?,
        );
        config.max_concurrent_instances = parse_positive(
            "DURASTATE_MAX_CONCURRENT_INSTANCES",
            32,
            "must be a positive integer",
        )?;

        Ok(config)
    }

    /// Backoff before retry number `attempt` (1-based): `retry_backoff * 2^(attempt - 1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exp)
    }
}

fn parse_positive<T>(var: &'static str, default: T, message: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
{
    let value: T = match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(var, message))?,
        Err(_) => default,
    };
    if value == T::default() {
        return Err(ConfigError::Invalid(var, message));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector configuration.

use std::time::Duration;

use crate::error::{ConnectorError, Result};

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.fivetran.com/v1";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

/// Credentials and endpoint of the remote connection API.
#[derive(Clone)]
pub struct ConnectorConfig {
    /// API base URL; endpoints are appended as path segments.
    pub base_url: String,
    /// Basic auth user.
    pub api_key: String,
    /// Basic auth password.
    pub api_secret: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConnectorConfig {
    /// Configuration for the default base URL and timeout.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DURASTATE_CONNECTOR_API_KEY`: API key (required)
    /// - `DURASTATE_CONNECTOR_API_SECRET`: API secret (required)
    /// - `DURASTATE_CONNECTOR_BASE_URL`: base URL (default: "https://api.fivetran.com/v1")
    /// - `DURASTATE_CONNECTOR_TIMEOUT_SECS`: request timeout (default: 90)
    pub fn from_env() -> Result<Self> {
        let api_key = required("DURASTATE_CONNECTOR_API_KEY")?;
        let api_secret = required("DURASTATE_CONNECTOR_API_SECRET")?;

        let base_url = std::env::var("DURASTATE_CONNECTOR_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let timeout_secs: u64 = std::env::var("DURASTATE_CONNECTOR_TIMEOUT_SECS")
            .unwrap_or_else(|_| DEFAULT_TIMEOUT.as_secs().to_string())
            .parse()
            .map_err(|e| {
                ConnectorError::Config(format!("invalid DURASTATE_CONNECTOR_TIMEOUT_SECS: {}", e))
            })?;
        if timeout_secs == 0 {
            return Err(ConnectorError::Config(
                "DURASTATE_CONNECTOR_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            base_url,
            api_key,
            api_secret,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn required(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConnectorError::Config(format!("{} is required", var))),
    }
}

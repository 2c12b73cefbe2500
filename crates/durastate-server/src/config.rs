// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server configuration from environment variables.

use std::net::SocketAddr;

use durastate_connector::{ConnectorConfig, ConnectorError};
use durastate_core::config::{ConfigError as EngineConfigError, EngineConfig};
use thiserror::Error;

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub http_addr: SocketAddr,
    /// Emit JSON log lines instead of the human readable format.
    pub log_json: bool,
    /// Engine settings.
    pub engine: EngineConfig,
    /// Remote API settings.
    pub connector: ConnectorConfig,
}

/// Invalid or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Engine variable problem.
    #[error(transparent)]
    Engine(#[from] EngineConfigError),

    /// Connector variable problem.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Server variable problem.
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, String),
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Server variables:
    /// - `DURASTATE_HTTP_PORT`: HTTP port (default: 8000)
    /// - `DURASTATE_LOG_FORMAT`: `json` for JSON logs (default: text)
    ///
    /// See [`EngineConfig::from_env`] and [`ConnectorConfig::from_env`] for the rest.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("DURASTATE_HTTP_PORT")
            .unwrap_or_else(|_| DEFAULT_HTTP_PORT.to_string())
            .parse()
            .map_err(|e| ConfigError::Invalid("DURASTATE_HTTP_PORT", format!("{}", e)))?;

        let log_json = std::env::var("DURASTATE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            log_json,
            engine: EngineConfig::from_env()?,
            connector: ConnectorConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn base_env(guard: &mut EnvGuard) {
        guard.set("DURASTATE_DATABASE_URL", "sqlite::memory:");
        guard.set("DURASTATE_CONNECTOR_API_KEY", "key");
        guard.set("DURASTATE_CONNECTOR_API_SECRET", "secret");
        guard.remove("DURASTATE_HTTP_PORT");
        guard.remove("DURASTATE_LOG_FORMAT");
        guard.remove("DURASTATE_CONNECTOR_BASE_URL");
        guard.remove("DURASTATE_CONNECTOR_TIMEOUT_SECS");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);

        let config = ServerConfig::from_env().unwrap();

        assert_eq!(config.http_addr.port(), 8000);
        assert!(!config.log_json);
        assert_eq!(config.engine.database_url, "sqlite::memory:");
        assert_eq!(config.connector.api_key, "key");
        assert_eq!(config.connector.base_url, "https://api.fivetran.com/v1");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);
        guard.set("DURASTATE_HTTP_PORT", "9100");
        guard.set("DURASTATE_LOG_FORMAT", "JSON");
        guard.set("DURASTATE_CONNECTOR_BASE_URL", "http://localhost:9999");

        let config = ServerConfig::from_env().unwrap();

        assert_eq!(config.http_addr.port(), 9100);
        assert!(config.log_json);
        assert_eq!(config.connector.base_url, "http://localhost:9999");
    }

    #[test]
    fn test_config_requires_credentials() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);
        guard.remove("DURASTATE_CONNECTOR_API_SECRET");

        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Connector(_)));
        assert!(err.to_string().contains("DURASTATE_CONNECTOR_API_SECRET"));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);
        guard.set("DURASTATE_HTTP_PORT", "not-a-port");

        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DURASTATE_HTTP_PORT"));
    }
}

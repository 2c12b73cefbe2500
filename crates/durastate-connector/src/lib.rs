// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durastate Connector - REST implementation of the connection service
//!
//! [`RestConnector`] implements [`durastate_core::ConnectorService`] against a
//! versioned JSON API using Basic auth. Failures are classified for the
//! orchestrator's retry policy:
//!
//! | Failure | Classification |
//! |---------|----------------|
//! | timeout, connection error | transient |
//! | `408`, `429`, `5xx` | transient |
//! | read-back state mismatch | transient |
//! | other `4xx`, non-JSON body | permanent |
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use durastate_connector::{ConnectorConfig, RestConnector};
//! use durastate_core::WorkflowCatalog;
//!
//! let connector = RestConnector::new(&ConnectorConfig::from_env()?)?;
//! let catalog = WorkflowCatalog::for_connector(Arc::new(connector));
//! ```

#![deny(missing_docs)]

/// REST client implementing the connector capabilities.
pub mod client;

/// Connector configuration.
pub mod config;

/// Connector error types.
pub mod error;

pub use client::RestConnector;
pub use config::ConnectorConfig;
pub use error::{ConnectorError, Result};

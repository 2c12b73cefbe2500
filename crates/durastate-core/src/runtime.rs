// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`EngineRuntime`] wires the store, lease manager, orchestrator, worker pool
//! and recovery loop together so an application only has to submit work.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use durastate_core::config::EngineConfig;
//! use durastate_core::runtime::EngineRuntime;
//! use durastate_core::workflow::WorkflowCatalog;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EngineRuntime::builder()
//!         .config(EngineConfig::from_env()?)
//!         .catalog(WorkflowCatalog::for_connector(Arc::new(my_connector)))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let receipt = runtime
//!         .service()
//!         .submit("UpdateState", serde_json::json!({"resource_id": "abc", "new_state": {}}), None)
//!         .await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::lease::LeaseManager;
use crate::orchestrator::Orchestrator;
use crate::persistence::{self, CheckpointStore};
use crate::recovery::RecoveryManager;
use crate::service::WorkflowService;
use crate::workflow::WorkflowCatalog;

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn CheckpointStore>>,
    catalog: Option<WorkflowCatalog>,
    config: Option<EngineConfig>,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("catalog", &self.catalog)
            .field("config", &self.config)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an already opened store instead of connecting to `config.database_url`.
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the workflow catalog (required).
    pub fn catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the engine configuration.
    ///
    /// Default: [`EngineConfig::new`] with an in-memory SQLite URL.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let catalog = self
            .catalog
            .ok_or_else(|| anyhow::anyhow!("catalog is required"))?;
        let config = self
            .config
            .unwrap_or_else(|| EngineConfig::new("sqlite::memory:"));
        if config.max_concurrent_instances == 0 {
            anyhow::bail!("max_concurrent_instances must be positive");
        }

        Ok(EngineRuntimeConfig {
            store: self.store,
            catalog,
            config,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    store: Option<Arc<dyn CheckpointStore>>,
    catalog: WorkflowCatalog,
    config: EngineConfig,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("store", &"...")
            .field("config", &self.config)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Open the store if needed and start the recovery loop. The loop sweeps
    /// once immediately, so instances interrupted by a previous process are
    /// resumed on start.
    pub async fn start(self) -> Result<EngineRuntime> {
        let store = match self.store {
            Some(store) => store,
            None => persistence::connect(&self.config.database_url).await?,
        };

        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            self.config.worker_id.clone(),
            self.config.lease_ttl,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(self.catalog),
            leases.clone(),
            self.config.clone(),
        ));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_instances as usize));

        let service = WorkflowService::new(orchestrator.clone(), permits.clone());
        let recovery = Arc::new(RecoveryManager::new(
            orchestrator,
            permits,
            self.config.recovery_interval,
        ));
        let recovery_shutdown = recovery.shutdown_handle();
        let recovery_handle = {
            let recovery = recovery.clone();
            tokio::spawn(async move { recovery.run().await })
        };

        info!(
            worker_id = %self.config.worker_id,
            max_concurrent_instances = self.config.max_concurrent_instances,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            service,
            recovery,
            recovery_handle,
            recovery_shutdown,
            leases,
            store,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - the worker pool dispatching submitted instances
/// - the recovery loop resuming interrupted instances
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    service: WorkflowService,
    recovery: Arc<RecoveryManager>,
    recovery_handle: JoinHandle<()>,
    recovery_shutdown: Arc<Notify>,
    leases: Arc<LeaseManager>,
    store: Arc<dyn CheckpointStore>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The submission API.
    pub fn service(&self) -> &WorkflowService {
        &self.service
    }

    /// The recovery manager, for on-demand sweeps.
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Get a reference to the checkpoint store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Check if the recovery loop is still running.
    pub fn is_running(&self) -> bool {
        !self.recovery_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the recovery loop, waits for in-flight runs to reach a terminal
    /// status (or stop), then releases any lease still cached.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.recovery_shutdown.notify_one();
        if let Err(e) = self.recovery_handle.await {
            error!("Recovery task panicked: {}", e);
        }

        self.service.shutdown().await;
        self.leases.release_all().await;

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

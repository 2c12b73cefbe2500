// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durastate Server - Connection State Workflow API
//!
//! An HTTP server responsible for:
//! - Accepting GetState / UpdateState submissions
//! - Running them durably on the engine worker pool
//! - Recovering instances abandoned by crashed workers

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use durastate_connector::RestConnector;
use durastate_core::{EngineRuntime, WorkflowCatalog};
use durastate_server::{AppState, ServerConfig, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = ServerConfig::from_env()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "durastate_core=info,durastate_connector=info,durastate_server=info".into());
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        http_addr = %config.http_addr,
        worker_id = %config.engine.worker_id,
        connector_url = %config.connector.base_url,
        "Starting Durastate Server"
    );

    let connector = Arc::new(RestConnector::new(&config.connector)?);

    let runtime = EngineRuntime::builder()
        .config(config.engine.clone())
        .catalog(WorkflowCatalog::for_connector(connector))
        .build()?
        .start()
        .await?;

    let app = build_router(AppState::new(runtime.service().clone()));
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;

    info!(addr = %config.http_addr, "HTTP server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Durastate Server shut down");

    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durastate Server - HTTP API over the workflow engine
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/workflows` | Submit `{workflow, input, id?}`; `202` new, `200` existing id |
//! | `GET` | `/workflows` | List instances (`status`, `limit`, `offset`) |
//! | `GET` | `/workflows/{id}` | Status with output or failure |
//! | `POST` | `/workflows/{id}/cancel` | Request cancellation |
//! | `GET` | `/health` | Database health (`503` when unreachable) |
//! | `GET` | `/api/info` | Service description |
//!
//! Errors are returned as `{"error": {"code", "message"}}`.

#![deny(missing_docs)]

/// Environment configuration.
pub mod config;

/// Handler error mapping.
pub mod error;

/// Request handlers.
pub mod handlers;

/// Route table.
pub mod router;

use durastate_core::WorkflowService;

pub use config::ServerConfig;
pub use error::ServerError;
pub use router::build_router;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Engine entry point.
    pub service: WorkflowService,
}

impl AppState {
    /// Wrap a running engine's service.
    pub fn new(service: WorkflowService) -> Self {
        Self { service }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Axum router for the submission API.

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::handlers;

/// Build the API router with tracing middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/info", get(handlers::api_info))
        .route(
            "/workflows",
            post(handlers::submit_workflow).get(handlers::list_workflows),
        )
        .route("/workflows/{id}", get(handlers::get_workflow))
        .route("/workflows/{id}/cancel", post(handlers::cancel_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

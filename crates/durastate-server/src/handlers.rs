// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers for the submission API.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::instrument;

use durastate_core::model::{InstanceStatus, InstanceSummary, WorkflowView};
use durastate_core::service::SubmitReceipt;

use crate::AppState;
use crate::error::ServerError;

/// Body of `POST /workflows`.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// `GetState` or `UpdateState`.
    pub workflow: String,
    /// Workflow input (`resource_id`, optional `new_state`).
    pub input: Value,
    /// Idempotency key; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
}

/// Query of `GET /workflows`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Status filter, case-insensitive.
    pub status: Option<String>,
    /// Page size.
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: Option<i64>,
}

/// Response of `GET /workflows`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    /// Instances, newest first.
    pub instances: Vec<InstanceSummary>,
}

/// `POST /workflows`: `202` for a new instance, `200` when the id existed.
#[instrument(skip(state, payload))]
pub async fn submit_workflow(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ServerError> {
    let Json(request) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let receipt = state
        .service
        .submit(&request.workflow, request.input, request.id)
        .await?;

    let status = if receipt.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}

/// `GET /workflows/{id}`
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowView>, ServerError> {
    Ok(Json(state.service.get(&id).await?))
}

/// `POST /workflows/{id}/cancel`
#[instrument(skip(state))]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowView>, ServerError> {
    Ok(Json(state.service.cancel(&id).await?))
}

/// `GET /workflows?status=&limit=&offset=`
pub async fn list_workflows(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListResponse>, ServerError> {
    let Query(query) = query.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let status = query
        .status
        .as_deref()
        .map(|s| InstanceStatus::parse(&s.to_ascii_lowercase()))
        .transpose()?;

    let instances = state
        .service
        .list(status, query.limit, query.offset)
        .await?;
    Ok(Json(ListResponse { instances }))
}

/// `GET /health`: `503` when the database is unreachable.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.service.health().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok", "in_flight": state.service.in_flight() })),
        ),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": "unavailable" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": e.to_string() })),
        ),
    }
}

/// `GET /api/info`
pub async fn api_info() -> Json<Value> {
    Json(json!({
        "service": "Durastate Connection State Manager",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "GET /api/info": "This endpoint - API information",
            "GET /health": "Service and database health",
            "POST /workflows": "Submit a workflow (body: workflow, input, optional id)",
            "GET /workflows": "List workflow instances (query: status, limit, offset)",
            "GET /workflows/{id}": "Workflow status with output or failure",
            "POST /workflows/{id}/cancel": "Request cancellation at the next step boundary",
        },
        "workflows": {
            "GetState": "Read the current state of a connection (input: resource_id)",
            "UpdateState": "Pause, update, resume, and verify a connection (input: resource_id, new_state)",
        },
        "description": "Durable state management for remote connections with checkpointed steps, crash recovery, and automatic resume on failure",
    }))
}

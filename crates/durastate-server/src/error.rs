// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API error type mapping engine errors to HTTP status codes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use durastate_core::error::EngineError;
use serde_json::json;
use thiserror::Error;

/// Error returned by handlers.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Malformed request (body, path, or query).
    #[error("{0}")]
    BadRequest(String),
}

impl ServerError {
    /// HTTP status and stable error code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ServerError::Engine(e) => {
                let status = match e {
                    EngineError::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
                    EngineError::LeaseHeld { .. } | EngineError::Conflict { .. } => {
                        StatusCode::CONFLICT
                    }
                    EngineError::Validation { .. } | EngineError::UnknownWorkflow { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.error_code())
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(code, error = %self, "Request failed");
        }

        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_status_mapping() {
        let cases = [
            (
                EngineError::InstanceNotFound {
                    instance_id: "x".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                EngineError::LeaseHeld {
                    instance_id: "x".to_string(),
                    holder_id: "w".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::Validation {
                    field: "new_state".to_string(),
                    message: "required".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                EngineError::UnknownWorkflow {
                    name: "Nope".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                EngineError::Database {
                    operation: "query".to_string(),
                    details: "closed".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let code = error.error_code();
            let (status, mapped_code) = ServerError::from(error).status_and_code();
            assert_eq!(status, expected);
            assert_eq!(mapped_code, code);
        }
    }

    #[test]
    fn test_bad_request() {
        let (status, code) = ServerError::BadRequest("bad json".to_string()).status_and_code();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "BAD_REQUEST");
    }
}

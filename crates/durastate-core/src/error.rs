// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for durastate-core.
//!
//! [`StepError`] is what a step adapter returns; [`EngineError`] is what the
//! executor, orchestrator, store, and submission API return. Every engine
//! error carries a stable code via [`EngineError::error_code`].

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure of a single side-effecting call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Network error, timeout, throttling. Retryable by policy.
    #[error("transient: {0}")]
    Transient(String),

    /// Rejected input, resource not found. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StepError {
    /// Whether the orchestrator may retry the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The cause without the classification prefix.
    pub fn cause(&self) -> &str {
        match self {
            Self::Transient(cause) | Self::Permanent(cause) => cause,
        }
    }
}

/// Engine errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A step attempt failed.
    #[error("step '{step}' (index {index}) failed: {cause}")]
    StepFailed {
        /// Step name.
        step: String,
        /// Step index.
        index: usize,
        /// Failure cause.
        cause: String,
        /// Whether the failure is transient.
        retryable: bool,
    },

    /// A checkpoint write raced with an already completed step.
    #[error(
        "conflicting checkpoint for instance '{instance_id}' step {index}: step already completed with a different output"
    )]
    Conflict {
        /// The instance id.
        instance_id: String,
        /// The completed step index.
        index: usize,
    },

    /// Another worker holds a valid lease on the instance.
    #[error("instance '{instance_id}' is leased by '{holder_id}'")]
    LeaseHeld {
        /// The instance id.
        instance_id: String,
        /// Current holder.
        holder_id: String,
    },

    /// This worker's lease expired or was taken over.
    #[error("lease on instance '{instance_id}' lost by '{holder_id}'")]
    LeaseLost {
        /// The instance id.
        instance_id: String,
        /// The worker that lost the lease.
        holder_id: String,
    },

    /// Both a step and its compensation failed; the remote resource needs an operator.
    #[error(
        "step '{step}' failed ({original}) and compensation '{compensation_step}' failed ({compensation})"
    )]
    CompensationFailed {
        /// Step that originally failed.
        step: String,
        /// Original failure cause.
        original: String,
        /// Compensating step name.
        compensation_step: String,
        /// Compensation failure cause.
        compensation: String,
    },

    /// Instance was not found.
    #[error("Instance '{instance_id}' not found")]
    InstanceNotFound {
        /// The instance id.
        instance_id: String,
    },

    /// Workflow name is not part of the catalog.
    #[error("unknown workflow '{name}'")]
    UnknownWorkflow {
        /// Submitted name.
        name: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Persisted JSON could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StepFailed { .. } => "STEP_FAILED",
            Self::Conflict { .. } => "CHECKPOINT_CONFLICT",
            Self::LeaseHeld { .. } => "LEASE_HELD",
            Self::LeaseLost { .. } => "LEASE_LOST",
            Self::CompensationFailed { .. } => "COMPENSATION_FAILED",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::UnknownWorkflow { .. } => "UNKNOWN_WORKFLOW",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub(crate) fn database(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for durastate-connector.

use durastate_core::error::StepError;
use thiserror::Error;

/// Result type using ConnectorError.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors talking to the remote connection API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Configuration error (missing or invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Request timed out.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection failed or the response could not be read.
    #[error("request failed: {0}")]
    Transport(String),

    /// The API answered with a non-success status.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// `message` field of the error body, or the status reason.
        message: String,
    },

    /// A success response that is not JSON.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Read-back state does not contain the expected state.
    #[error("state mismatch: expected {expected}, found {actual}")]
    StateMismatch {
        /// Expected state (JSON).
        expected: String,
        /// State read back (JSON).
        actual: String,
    },
}

impl ConnectorError {
    /// Whether the call may succeed if repeated.
    ///
    /// Timeouts, transport failures, throttling (`429`), `408` and server errors
    /// are retryable, as is a state mismatch: the API may apply writes
    /// asynchronously.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::StateMismatch { .. } => true,
            Self::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Config(_) | Self::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectorError::Timeout(err.to_string())
        } else if err.is_builder() {
            ConnectorError::Config(err.to_string())
        } else {
            ConnectorError::Transport(err.to_string())
        }
    }
}

impl From<ConnectorError> for StepError {
    fn from(err: ConnectorError) -> Self {
        if err.is_retryable() {
            StepError::Transient(err.to_string())
        } else {
            StepError::Permanent(err.to_string())
        }
    }
}

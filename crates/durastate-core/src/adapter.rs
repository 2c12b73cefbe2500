// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step adapters: the side-effecting leaves of a workflow.
//!
//! A [`StepAdapter`] performs exactly one externally visible call and carries
//! no durability logic. Adapters must be safe to invoke more than once: the
//! executor guarantees a completed step is never invoked again, but a step
//! interrupted by a crash before its checkpoint is re-invoked on recovery.
//!
//! The connection-state workflows reach the remote service through
//! [`ConnectorService`]; [`ConnectorStep`] turns each of its capabilities into
//! an adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StepError;
use crate::model::ConnectionInput;

/// One side-effecting step.
#[async_trait]
pub trait StepAdapter: Send + Sync {
    /// Step name as recorded in checkpoints.
    fn name(&self) -> &str;

    /// Perform the call. `prior_outputs` holds the outputs of every earlier
    /// step of the same instance, in index order.
    async fn invoke(&self, input: &Value, prior_outputs: &[Value]) -> Result<Value, StepError>;
}

/// Capabilities of the remote connection-state service.
///
/// Implementations classify failures: network errors, timeouts, throttling and
/// server errors are [`StepError::Transient`]; rejected input and unknown
/// resources are [`StepError::Permanent`]. Pausing a paused connection and
/// resuming a running one must succeed.
#[async_trait]
pub trait ConnectorService: Send + Sync {
    /// Read the current state of a connection.
    async fn get_state(&self, resource_id: &str) -> Result<Value, StepError>;

    /// Pause a connection.
    async fn pause(&self, resource_id: &str) -> Result<Value, StepError>;

    /// Replace the state of a (paused) connection.
    async fn update_state(&self, resource_id: &str, new_state: &Value)
    -> Result<Value, StepError>;

    /// Resume a connection.
    async fn resume(&self, resource_id: &str) -> Result<Value, StepError>;

    /// Read the state back and check that `expected` is reflected in it.
    async fn verify_state(&self, resource_id: &str, expected: &Value)
    -> Result<Value, StepError>;
}

/// Which connector capability a [`ConnectorStep`] invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorCall {
    /// Read the state before changing anything.
    GetCurrentState,
    /// Pause the connection.
    Pause,
    /// Write `new_state`.
    UpdateState,
    /// Resume the connection.
    Resume,
    /// Read back and compare with `new_state`.
    VerifyState,
    /// Compensation: make sure the connection is not left paused.
    EnsureResumed,
}

impl ConnectorCall {
    /// Step name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetCurrentState => "GetCurrentState",
            Self::Pause => "Pause",
            Self::UpdateState => "UpdateState",
            Self::Resume => "Resume",
            Self::VerifyState => "VerifyState",
            Self::EnsureResumed => "EnsureResumed",
        }
    }
}

/// Adapter invoking one [`ConnectorService`] capability with the workflow input.
pub struct ConnectorStep {
    call: ConnectorCall,
    connector: Arc<dyn ConnectorService>,
}

impl ConnectorStep {
    /// Create an adapter for `call`.
    pub fn new(call: ConnectorCall, connector: Arc<dyn ConnectorService>) -> Self {
        Self { call, connector }
    }

    /// Same as [`ConnectorStep::new`], boxed for a workflow definition.
    pub fn arc(call: ConnectorCall, connector: Arc<dyn ConnectorService>) -> Arc<dyn StepAdapter> {
        Arc::new(Self::new(call, connector))
    }

    /// The capability invoked.
    pub fn call(&self) -> ConnectorCall {
        self.call
    }
}

fn required_state(input: &ConnectionInput) -> Result<&Value, StepError> {
    input
        .new_state
        .as_ref()
        .ok_or_else(|| StepError::Permanent("new_state is required".to_string()))
}

#[async_trait]
impl StepAdapter for ConnectorStep {
    fn name(&self) -> &str {
        self.call.as_str()
    }

    async fn invoke(&self, input: &Value, _prior_outputs: &[Value]) -> Result<Value, StepError> {
        let input =
            ConnectionInput::from_value(input).map_err(|e| StepError::Permanent(e.to_string()))?;
        let resource_id = input.resource_id.as_str();

        match self.call {
            ConnectorCall::GetCurrentState => self.connector.get_state(resource_id).await,
            ConnectorCall::Pause => self.connector.pause(resource_id).await,
            ConnectorCall::UpdateState => {
                let new_state = required_state(&input)?;
                self.connector.update_state(resource_id, new_state).await
            }
            ConnectorCall::Resume | ConnectorCall::EnsureResumed => {
                self.connector.resume(resource_id).await
            }
            ConnectorCall::VerifyState => {
                let new_state = required_state(&input)?;
                self.connector.verify_state(resource_id, new_state).await
            }
        }
    }
}

/// Whether every field of `expected` is present with an equal value in `actual`.
///
/// Objects are compared recursively so extra fields in `actual` are ignored;
/// any other value must match exactly.
pub fn state_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| state_contains(a, v))),
        _ => actual == expected,
    }
}

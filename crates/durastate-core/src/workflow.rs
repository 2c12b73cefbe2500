// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions and the catalog the orchestrator resolves them from.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::adapter::{ConnectorCall, ConnectorService, ConnectorStep, StepAdapter};
use crate::compensation::Compensation;
use crate::error::{EngineError, Result};
use crate::model::{ConnectionInput, WorkflowName};

/// Builds the workflow output from the forward step outputs (in index order).
pub type OutputAssembler = fn(&[Value]) -> Value;

/// A linear step sequence with an optional compensating step.
#[derive(Clone)]
pub struct WorkflowDefinition {
    /// Catalog key.
    pub name: WorkflowName,
    /// Forward steps; the position is the checkpoint index.
    pub steps: Vec<Arc<dyn StepAdapter>>,
    /// Runs when a forward step fails after arming.
    pub compensation: Option<Compensation>,
    /// Output assembly on completion.
    pub assemble: OutputAssembler,
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("compensation", &self.compensation)
            .finish()
    }
}

impl WorkflowDefinition {
    /// `GetCurrentState`, no compensation.
    pub fn get_state(connector: Arc<dyn ConnectorService>) -> Self {
        Self {
            name: WorkflowName::GetState,
            steps: vec![ConnectorStep::arc(ConnectorCall::GetCurrentState, connector)],
            compensation: None,
            assemble: get_state_output,
        }
    }

    /// `GetCurrentState → Pause → UpdateState → Resume → VerifyState`, with
    /// `EnsureResumed` armed once `Pause` has been attempted.
    pub fn update_state(connector: Arc<dyn ConnectorService>) -> Self {
        let steps = [
            ConnectorCall::GetCurrentState,
            ConnectorCall::Pause,
            ConnectorCall::UpdateState,
            ConnectorCall::Resume,
            ConnectorCall::VerifyState,
        ]
        .into_iter()
        .map(|call| ConnectorStep::arc(call, connector.clone()))
        .collect();

        Self {
            name: WorkflowName::UpdateState,
            steps,
            compensation: Some(Compensation::new(
                ConnectorStep::arc(ConnectorCall::EnsureResumed, connector),
                1,
            )),
            assemble: update_state_output,
        }
    }

    /// Number of forward steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

fn get_state_output(outputs: &[Value]) -> Value {
    json!({
        "current_state": outputs.first().cloned().unwrap_or(Value::Null),
        "message": "Current state retrieved",
    })
}

fn update_state_output(outputs: &[Value]) -> Value {
    let at = |i: usize| outputs.get(i).cloned().unwrap_or(Value::Null);
    json!({
        "current_state": at(0),
        "update_result": at(2),
        "verified_state": at(4),
        "message": "State updated and verified successfully",
    })
}

/// Check a submission's input against what the workflow needs.
pub fn validate_input(name: WorkflowName, input: &Value) -> Result<ConnectionInput> {
    let parsed = ConnectionInput::from_value(input)?;
    if name == WorkflowName::UpdateState && parsed.new_state.is_none() {
        return Err(EngineError::Validation {
            field: "new_state".to_string(),
            message: "UpdateState requires new_state; use GetState to read the current state"
                .to_string(),
        });
    }
    Ok(parsed)
}

/// Every workflow the engine can run, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    definitions: HashMap<WorkflowName, Arc<WorkflowDefinition>>,
}

impl WorkflowCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection-state workflows backed by `connector`.
    pub fn for_connector(connector: Arc<dyn ConnectorService>) -> Self {
        let mut catalog = Self::new();
        catalog.insert(WorkflowDefinition::get_state(connector.clone()));
        catalog.insert(WorkflowDefinition::update_state(connector));
        catalog
    }

    /// Register (or replace) a definition.
    pub fn insert(&mut self, definition: WorkflowDefinition) {
        self.definitions
            .insert(definition.name, Arc::new(definition));
    }

    /// Look up a definition.
    pub fn get(&self, name: WorkflowName) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .get(&name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow {
                name: name.to_string(),
            })
    }
}

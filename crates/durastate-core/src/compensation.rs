// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-step compensation for saga-style rollback.
//!
//! A workflow definition may name one compensating step. It runs when a
//! forward step fails for good (or the instance is cancelled) after the
//! compensation was armed, and is checkpointed like any other step under the
//! pseudo-index right after the last forward step.

use std::sync::Arc;

use crate::adapter::StepAdapter;
use crate::model::{FailureInfo, StepStatus, WorkflowInstance};

/// Compensating step of a workflow definition.
#[derive(Clone)]
pub struct Compensation {
    /// The step to run.
    pub step: Arc<dyn StepAdapter>,
    /// Forward step index whose first attempt arms the compensation.
    pub armed_after: usize,
}

impl Compensation {
    /// Create a compensation armed once step `armed_after` has been attempted.
    pub fn new(step: Arc<dyn StepAdapter>, armed_after: usize) -> Self {
        Self { step, armed_after }
    }

    /// Whether the instance has progressed far enough to need compensation.
    ///
    /// Armed as soon as the arming step was attempted at all, even if that
    /// attempt failed or was interrupted: the remote side effect may have
    /// happened.
    pub fn is_armed(&self, instance: &WorkflowInstance) -> bool {
        instance
            .step(self.armed_after)
            .is_some_and(|s| s.status != StepStatus::Pending)
    }

    /// Checkpoint index of the compensating step for a definition with
    /// `forward_steps` forward steps.
    pub fn index(forward_steps: usize) -> usize {
        forward_steps
    }
}

impl std::fmt::Debug for Compensation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compensation")
            .field("step", &self.step.name())
            .field("armed_after", &self.armed_after)
            .finish()
    }
}

/// Failure record after the compensating step itself failed.
pub fn with_compensation_error(mut failure: FailureInfo, cause: impl Into<String>) -> FailureInfo {
    failure.compensation_error = Some(cause.into());
    failure
}

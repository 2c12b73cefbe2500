// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background recovery of interrupted instances.
//!
//! Instances left non-terminal by a crashed worker keep their (expiring)
//! lease. Once it lapses, a sweep finds them and hands them back to
//! [`Orchestrator::run`], which continues from the last checkpoint. Retries are
//! bounded by the persisted attempt counts, so an instance that keeps failing
//! ends `FAILED` instead of being swept forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::orchestrator::Orchestrator;

/// Maximum instances picked up per sweep.
const SWEEP_BATCH: i64 = 256;

/// Outcome of one recovery sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances driven to a terminal status.
    pub resumed: Vec<String>,
    /// Instances another worker leased first.
    pub skipped: Vec<String>,
    /// Instances whose run stopped with an error, with that error.
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    /// Whether nothing was found.
    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Finds and resumes interrupted instances.
pub struct RecoveryManager {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl RecoveryManager {
    /// Create a recovery manager sharing the worker pool's `permits`.
    pub fn new(orchestrator: Arc<Orchestrator>, permits: Arc<Semaphore>, interval: Duration) -> Self {
        Self {
            orchestrator,
            permits,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Resume every recoverable instance once and wait for the runs.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let ids = self
            .orchestrator
            .store()
            .list_recoverable(Utc::now(), SWEEP_BATCH)
            .await?;

        let mut report = SweepReport::default();
        if ids.is_empty() {
            debug!("No recoverable instances");
            return Ok(report);
        }
        info!(count = ids.len(), "Recovering instances");

        let mut runs = JoinSet::new();
        for id in ids {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                warn!("Worker pool closed, stopping sweep");
                break;
            };
            let orchestrator = self.orchestrator.clone();
            runs.spawn(async move {
                let _permit = permit;
                let result = orchestrator.run(&id).await;
                (id, result)
            });
        }

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((id, Ok(view))) => {
                    debug!(instance_id = %id, status = %view.status, "Recovered instance");
                    report.resumed.push(id);
                }
                Ok((id, Err(EngineError::LeaseHeld { .. }))) => report.skipped.push(id),
                Ok((id, Err(e))) => {
                    warn!(instance_id = %id, error = %e, "Recovery run stopped");
                    report.failed.push((id, e.to_string()));
                }
                Err(e) => error!(error = %e, "Recovery task panicked"),
            }
        }

        info!(
            resumed = report.resumed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Recovery sweep finished"
        );
        Ok(report)
    }

    /// Sweep immediately, then every interval until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Recovery manager started"
        );

        loop {
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Recovery sweep failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Recovery manager received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Recovery manager stopped");
    }
}

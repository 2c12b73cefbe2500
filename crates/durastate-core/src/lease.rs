// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance leases: at most one active executor per instance.
//!
//! Leases live in the store and expire on their own, so a crashed worker's
//! instances become recoverable after one TTL. While a run is in flight a
//! background task renews the lease every `ttl / 3`; a failed renewal flags
//! the lease as lost and the orchestrator stops at the next step boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::Lease;
use crate::persistence::CheckpointStore;

/// Acquires, renews and releases leases for one worker identity.
pub struct LeaseManager {
    store: Arc<dyn CheckpointStore>,
    holder_id: String,
    ttl: Duration,
    held: Mutex<HashMap<String, Lease>>,
}

impl LeaseManager {
    /// Create a manager for `holder_id`.
    pub fn new(store: Arc<dyn CheckpointStore>, holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// This worker's holder id.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Lease time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lease on `instance_id`. `None` if another holder has a valid
    /// lease (re-acquiring one's own valid lease also yields `None`).
    pub async fn acquire(&self, instance_id: &str) -> Result<Option<Lease>> {
        let lease = self
            .store
            .acquire_lease(instance_id, &self.holder_id, self.ttl)
            .await?;
        if let Some(lease) = &lease {
            debug!(instance_id, expires_at = %lease.expires_at, "Lease acquired");
            self.cache(lease.clone());
        }
        Ok(lease)
    }

    /// Extend `lease` by one TTL. `None` means the lease is gone.
    pub async fn renew(&self, lease: &Lease) -> Result<Option<Lease>> {
        let renewed = self.store.renew_lease(lease, self.ttl).await?;
        match &renewed {
            Some(renewed) => self.cache(renewed.clone()),
            None => self.forget(&lease.instance_id),
        }
        Ok(renewed)
    }

    /// Give the lease back.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        self.forget(&lease.instance_id);
        self.store.release_lease(lease).await?;
        debug!(instance_id = %lease.instance_id, "Lease released");
        Ok(())
    }

    /// Leases this worker currently believes it holds.
    pub fn held(&self) -> Vec<Lease> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Release every cached lease, for shutdown.
    pub async fn release_all(&self) {
        for lease in self.held() {
            if let Err(e) = self.release(&lease).await {
                warn!(instance_id = %lease.instance_id, error = %e, "Failed to release lease");
            }
        }
    }

    /// Keep `lease` alive in the background until the handle is stopped.
    pub fn spawn_renewal(self: &Arc<Self>, lease: Lease) -> RenewalHandle {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(lease.clone()));
        let interval = (self.ttl / 3).max(Duration::from_millis(10));

        let task = {
            let manager = self.clone();
            let cancel = cancel.clone();
            let lost = lost.clone();
            let current = current.clone();
            tokio::spawn(async move {
                let mut lease = lease;
                loop {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => break,

                        _ = tokio::time::sleep(interval) => {
                            match manager.renew(&lease).await {
                                Ok(Some(renewed)) => {
                                    lease = renewed;
                                    *current.lock().unwrap_or_else(PoisonError::into_inner) =
                                        lease.clone();
                                }
                                Ok(None) => {
                                    warn!(instance_id = %lease.instance_id, "Lease lost");
                                    lost.store(true, Ordering::SeqCst);
                                    break;
                                }
                                Err(e) => {
                                    warn!(
                                        instance_id = %lease.instance_id,
                                        error = %e,
                                        "Failed to renew lease, retrying"
                                    );
                                }
                            }
                        }
                    }
                }
            })
        };

        RenewalHandle {
            cancel,
            lost,
            current,
            task,
        }
    }

    fn cache(&self, lease: Lease) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lease.instance_id.clone(), lease);
    }

    fn forget(&self, instance_id: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
    }
}

/// Background renewal of one lease.
pub struct RenewalHandle {
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    current: Arc<Mutex<Lease>>,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// Whether a renewal found the lease expired or taken over.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and return the most recently renewed lease.
    pub async fn stop(self) -> Lease {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            info!(error = %e, "Lease renewal task ended abnormally");
        }
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

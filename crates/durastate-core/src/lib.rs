// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durastate Core - Durable Workflow Engine
//!
//! This crate runs short, linear workflows against an external service so that
//! a crash at any point neither repeats a completed side effect nor leaves the
//! remote resource half-changed. Every step result is checkpointed before the
//! next step starts; a restarted worker replays completed steps from the store
//! and continues from the first incomplete one.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      WorkflowService                         │
//! │            (submit / get / cancel / list, worker pool)       │
//! └──────────────────────────────────────────────────────────────┘
//!              │ dispatch                          ▲ sweep
//!              ▼                                   │
//! ┌──────────────────────────┐        ┌───────────────────────────┐
//! │      Orchestrator        │◄───────│     RecoveryManager       │
//! │ retries, cancellation,   │        │ resumes expired-lease     │
//! │ compensation             │        │ instances                 │
//! └──────────────────────────┘        └───────────────────────────┘
//!      │               │
//!      ▼               ▼
//! ┌──────────────┐ ┌──────────────┐     ┌──────────────────────────┐
//! │ StepExecutor │ │ LeaseManager │     │ StepAdapter (connector)  │
//! │ checkpoint / │─┼──────────────┼────►│ GetCurrentState, Pause,  │
//! │ replay       │ │ acquire/renew│     │ UpdateState, Resume, ... │
//! └──────────────┘ └──────────────┘     └──────────────────────────┘
//!      │               │
//!      ▼               ▼
//! ┌──────────────────────────────┐
//! │  CheckpointStore             │
//! │  (SQLite or PostgreSQL)      │
//! └──────────────────────────────┘
//! ```
//!
//! # Instance Status State Machine
//!
//! ```text
//!   PENDING ──► RUNNING ──────────────────────────► COMPLETED
//!                  │ │
//!                  │ └─ cancel ─► CANCELLING ─┐
//!                  │                          │ failure / cancel
//!                  ▼                          ▼
//!               FAILED ◄── not armed ── (forward failure)
//!                  ▲                          │ armed
//!                  │                          ▼
//!                  └── compensation fails ─ COMPENSATING ─► COMPENSATED
//! ```
//!
//! `COMPLETED`, `FAILED` and `COMPENSATED` are terminal; a terminal instance
//! never changes again.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables, see [`config`]:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DURASTATE_DATABASE_URL` | Yes | - | `sqlite:` path or PostgreSQL connection string |
//! | `DURASTATE_WORKER_ID` | No | random | Lease holder id of this process |
//! | `DURASTATE_LEASE_TTL_SECS` | No | `30` | Lease time-to-live |
//! | `DURASTATE_MAX_STEP_ATTEMPTS` | No | `3` | Attempts per step, across restarts |
//! | `DURASTATE_MAX_CONCURRENT_INSTANCES` | No | `32` | Worker pool size |
//!
//! # Modules
//!
//! - [`persistence`]: checkpoint store trait with SQLite and PostgreSQL backends
//! - [`executor`]: checkpointed execution and replay of a single step
//! - [`orchestrator`]: drives an instance to a terminal status
//! - [`lease`]: exclusive per-instance ownership with renewal
//! - [`recovery`]: background resumption of interrupted instances
//! - [`service`]: submission API
//! - [`runtime`]: embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Step adapter trait and the connector-backed steps.
pub mod adapter;

/// Compensating step arming rules.
pub mod compensation;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Checkpointed execution of one step.
pub mod executor;

/// Instance lease acquisition, renewal and release.
pub mod lease;

/// Embedded database migrations.
pub mod migrations;

/// Instances, step records, leases and views.
pub mod model;

/// Drives a workflow instance through its steps.
pub mod orchestrator;

/// Checkpoint store backends.
pub mod persistence;

/// Recovery sweeps for interrupted instances.
pub mod recovery;

/// Embeddable runtime.
pub mod runtime;

/// Submission API.
pub mod service;

/// Workflow definitions and catalog.
pub mod workflow;

pub use adapter::{ConnectorService, StepAdapter};
pub use config::EngineConfig;
pub use error::{EngineError, Result, StepError};
pub use model::{InstanceStatus, WorkflowName, WorkflowView};
pub use persistence::CheckpointStore;
pub use runtime::EngineRuntime;
pub use service::WorkflowService;
pub use workflow::WorkflowCatalog;

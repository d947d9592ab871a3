// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CDS Engine - Workflow Run Admission Control
//!
//! Decides which workflow runs and job runs may start when they share a named
//! concurrency rule, and which ones have to wait or be cancelled.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  RunEnqueue   ┌───────────────────────────────────────────┐
//! │  RunTrigger  │──────────────►│                 RunEngine                 │
//! │ (producers)  │   (mpsc)      │  enqueue_run / enqueue_job / release      │
//! └──────────────┘               │              │                            │
//!                                │              ▼                            │
//!                                │   ┌─────────────────────────────┐         │
//!                                │   │   Admission controller      │         │
//!                                │   │  (concurrency module)       │         │
//!                                │   └─────────────────────────────┘         │
//!                                └──────────────────┬────────────────────────┘
//!                                                   │ UnitOfWork
//! ┌──────────────────┐  ┌──────────────────┐        ▼
//! │ UnlockScheduler  │  │ RetentionWorker  │  ┌───────────────────────┐
//! │ (blocked groups) │  │ (policies)       │─►│ cds-core RunStore     │
//! └──────────────────┘  └──────────────────┘  │ (PostgreSQL / SQLite) │
//!                                             └───────────────────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CDS_DATABASE_URL` | Yes | - | `postgres://...` or `sqlite:...` |
//! | `CDS_DATABASE_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `CDS_UNLOCK_POLL_INTERVAL_SECS` | No | `5` | Unlock scheduler interval |
//! | `CDS_UNLOCK_BATCH_SIZE` | No | `50` | Rule groups per unlock pass |
//! | `CDS_RETENTION_ENABLED` | No | `false` | Apply run retention policies |
//! | `CDS_RETENTION_POLL_INTERVAL_SECS` | No | `3600` | Retention interval |
//! | `CDS_RETENTION_DEFAULT_COUNT` | No | `50` | Runs kept per workflow and ref without a project policy |
//! | `CDS_RETENTION_DEFAULT_DURATION_DAYS` | No | `90` | Age before deletion without a project policy |
//! | `CDS_RETENTION_BATCH_SIZE` | No | `100` | Runs per deletion batch |
//!
//! # Modules
//!
//! - [`concurrency`]: Admission decisions for a rule group
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types for engine operations
//! - [`run_engine`]: Enqueue, release and unlock of runs and jobs
//! - [`unlock_scheduler`]: Periodic re-check of blocked rule groups
//! - [`retention_worker`]: Project run retention policies
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Admission decisions for workflow runs and job runs sharing a rule.
pub mod concurrency;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Background worker applying project run retention policies.
pub mod retention_worker;

/// Run engine: enqueue, release and unlock.
pub mod run_engine;

/// Embeddable runtime for cds-engine.
pub mod runtime;

/// Periodic re-check of blocked rule groups.
pub mod unlock_scheduler;

pub use config::Config;
pub use error::{Error, Result};

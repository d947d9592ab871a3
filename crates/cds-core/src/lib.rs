// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CDS Core - Workflow Run Model and Persistence
//!
//! This crate holds the typed model of workflow runs, job runs and the named
//! concurrency rules that gate them, together with the persistence layer the
//! run engine reads and writes through.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              cds-engine                                 │
//! │     (Admission controller, Run engine, Unlock scheduler, Retention)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    │ RunStore / UnitOfWork
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         cds-core (This Crate)                           │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌───────────────────────────┐   │
//! │  │    Types    │  │   Persistence    │  │        Migrations         │   │
//! │  │ runs, jobs, │  │ Postgres/SQLite  │  │  postgresql/ and sqlite/  │   │
//! │  │ concurrency │  │  unit of work    │  │                           │   │
//! │  └─────────────┘  └──────────────────┘  └───────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//!                     ┌──────────────────────────────┐
//!                     │     PostgreSQL or SQLite     │
//!                     └──────────────────────────────┘
//! ```
//!
//! # Run Status State Machine
//!
//! ```text
//!   ┌──────────┐   no rule    ┌──────────┐
//!   │ CRAFTING │─────────────►│ BUILDING │──────┬─────────┬─────────┐
//!   └────┬─────┘              └──────────┘      │         │         │
//!        │ rule                    ▲          success    fail     stopped
//!        ▼                         │ unlock     │         │         │
//!   ┌──────────┐                   │            ▼         ▼         ▼
//!   │ BLOCKED  │───────────────────┘       ┌─────────┐ ┌──────┐ ┌─────────┐
//!   └────┬─────┘                           │ SUCCESS │ │ FAIL │ │ STOPPED │
//!        │ cancel-in-progress              └─────────┘ └──────┘ └─────────┘
//!        └──────────────────────────────────────────────────────────►
//! ```
//!
//! # Modules
//!
//! - [`error`]: Error type shared by the persistence backends
//! - [`types`]: Workflow runs, job runs, concurrency rules and objects
//! - [`persistence`]: `RunStore` trait, unit of work, Postgres and SQLite backends
//! - [`migrations`]: Embedded schema migrations for both backends

#![deny(missing_docs)]

/// Error types for persistence and model conversions.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Persistence interfaces and backends.
pub mod persistence;

/// Workflow run, job run and concurrency types.
pub mod types;

pub use error::{Error, Result};

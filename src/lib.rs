//! strata - Task-graph pipeline orchestrator
//!
//! Runs the same multi-stage pipeline over many independent units of work.
//! Each unit becomes a graph of tasks; tasks can spawn children at runtime,
//! read each other's results through promises, and be encapsulated so that
//! a subgraph of unknown width counts as one dependency.
//!
//! # Architecture
//!
//! - Inputs are fetched into a content-addressed artifact store, with
//!   classified failures and bounded retries for remote objects
//! - A single coordinator schedules tasks against a core budget
//! - Every state change is recorded as an immutable event; run state is
//!   derived by replaying them
//!
//! # Modules
//!
//! - `core`: Store, fetcher, task graph, engine, builder, resolver
//! - `domain`: Data structures (Event, Run, ArtifactHandle)
//! - `adapters`: External programs (stage commands, s3am, HTTPS)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Write a configuration template, then run it
//! strata generate-config
//! strata run --config strata_config.yaml --journal
//!
//! # Inspect a journaled run
//! strata status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Engine, Orchestrator, RunContext, TaskGraph, TaskSpec};
pub use domain::{ArtifactHandle, Event, EventType, Run, RunState, TaskId};

//! Domain types for the strata orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of run and task state changes
//! - Run: Journal-derived run state
//! - Artifact: Handles naming stored blobs

pub mod artifact;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use artifact::ArtifactHandle;
pub use events::{Event, EventType, TaskId, TaskState};
pub use run::{Run, RunState, TaskRecord};

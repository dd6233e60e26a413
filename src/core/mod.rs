//! Core orchestration logic.
//!
//! This module contains:
//! - ArtifactStore: content-addressed blob storage
//! - RemoteFetcher: location parsing, classified and bounded transfers
//! - TaskGraph / Engine: dynamic task graphs with promises and encapsulation
//! - ConfigResolver / TaskGraphBuilder: configuration to per-unit graphs
//! - EventStore: append-only run journal
//! - Orchestrator: resolve, build and run a whole pipeline

pub mod builder;
pub mod context;
pub mod engine;
pub mod event_store;
pub mod fetch;
pub mod graph;
pub mod orchestrator;
pub mod promise;
pub mod resolver;
pub mod store;
pub mod task;

// Re-export commonly used types
pub use builder::{cpu_share, BuildError, InputSlot, Stage, StageKind, TaskGraphBuilder, Toolkit, UnitGraph};
pub use context::{RetryPolicy, RunContext};
pub use engine::{Engine, RunError, RunOutcome};
pub use event_store::EventStore;
pub use fetch::{
    BadRequestHint, Credentials, FetchError, KeyMode, LocationRef, RemoteFetcher, RemoteObject, TransferFailure,
    Transport,
};
pub use graph::{GraphError, TaskGraph};
pub use orchestrator::{Orchestrator, PipelineError, PipelineReport, UnitResult};
pub use promise::{Promise, PromiseError};
pub use resolver::{ConfigError, ConfigResolver, ResolvedConfig, SharedOptions, StorageMode, UnitConfig};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, StoreError};
pub use task::{FnBody, Input, Resources, TaskBody, TaskContext, TaskRef, TaskSpec};

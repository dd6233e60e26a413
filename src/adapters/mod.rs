//! Adapter interfaces for external systems.
//!
//! Adapters run the external programs that task bodies and transfers
//! depend on: stage commands (`command`), the `s3am` transfer helper
//! (`s3am`) and plain HTTPS downloads (`http`).

pub mod command;
pub mod http;
pub mod s3am;
pub mod toolkit;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use command::CommandAdapter;
pub use http::HttpTransport;
pub use s3am::S3amTransport;
pub use toolkit::{CommandToolkit, PipelineCommands};

/// Output from an adapter execution
#[derive(Debug, Clone)]
pub struct AdapterOutput {
    /// Standard output of the program
    pub content: String,

    /// Standard error, kept for diagnostics
    pub diagnostics: String,

    /// Wall time of the execution
    pub elapsed: Duration,
}

/// Trait for external adapters
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Execute an action with input on stdin
    async fn execute(&self, action: &str, input: &str, timeout: Duration) -> Result<AdapterOutput>;

    /// Check the adapter's program can be started
    async fn health_check(&self) -> Result<()>;
}

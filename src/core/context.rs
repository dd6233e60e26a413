//! Process-wide run context.
//!
//! A `RunContext` is built once per pipeline invocation and shared by
//! reference with every component: it owns the artifact store, the core
//! budget, and the retry policy used by the remote fetcher.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::fetch::{OfflineTransport, RemoteFetcher, Transport};
use super::store::ArtifactStore;

/// Shared, read-only state of one pipeline invocation
#[derive(Clone)]
pub struct RunContext {
    store: Arc<dyn ArtifactStore>,
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
    max_cores: u32,
}

impl RunContext {
    /// Create a context using every core on the machine
    pub fn new(store: Arc<dyn ArtifactStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            retry_policy: RetryPolicy::default(),
            max_cores: available_cores(),
        }
    }

    /// Context whose fetcher only accepts local paths
    pub fn offline(store: Arc<dyn ArtifactStore>) -> Self {
        Self::new(store, Arc::new(OfflineTransport))
    }

    /// Cap the number of cores the engine may hand out at once
    pub fn with_max_cores(mut self, max_cores: u32) -> Self {
        self.max_cores = max_cores.max(1);
        self
    }

    /// Replace the transfer retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn max_cores(&self) -> u32 {
        self.max_cores
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fetcher bound to this context's store, transport and retry policy
    pub fn fetcher(&self) -> RemoteFetcher {
        RemoteFetcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.retry_policy.clone(),
        )
    }
}

/// Number of cores on this machine
pub fn available_cores() -> u32 {
    num_cpus::get() as u32
}

/// Retry policy for remote transfers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds (0 retries immediately)
    #[serde(default)]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: 0,
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately up to `max_attempts` in total
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Calculate delay before the retry following `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay_ms == 0 {
            return Duration::ZERO;
        }
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

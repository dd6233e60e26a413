//! Pipeline orchestration.
//!
//! Resolves a configuration, builds every unit's graph into one task graph
//! and runs it on a single engine. The first fatal error, whether from
//! configuration, fetching or a task, ends the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::builder::{BuildError, TaskGraphBuilder, Toolkit, UnitGraph};
use super::context::RunContext;
use super::engine::{Engine, RunError, RunOutcome};
use super::graph::TaskGraph;
use super::promise::PromiseError;
use super::resolver::{ConfigError, ConfigResolver, ResolvedConfig};
use crate::domain::TaskId;

/// Errors ending a pipeline invocation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unit '{unit}': {source}")]
    Build {
        unit: String,
        #[source]
        source: BuildError,
    },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("unit '{unit}' finished without a result: {source}")]
    MissingResult {
        unit: String,
        #[source]
        source: PromiseError,
    },
}

impl PipelineError {
    /// Unit the error originated in, when it came from one
    pub fn unit(&self) -> Option<&str> {
        match self {
            PipelineError::Build { unit, .. } | PipelineError::MissingResult { unit, .. } => Some(unit),
            PipelineError::Run(err) => err.unit(),
            PipelineError::Config(_) => None,
        }
    }

    /// Task the error originated in, when it came from one
    pub fn task(&self) -> Option<TaskId> {
        match self {
            PipelineError::Run(err) => err.failed_task(),
            _ => None,
        }
    }
}

/// Result of one unit of work
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub unit: String,
    pub root: TaskId,
    pub aggregate: TaskId,
    /// Output of the unit's aggregation task, promises substituted
    pub output: Value,
}

/// Result of a successful pipeline invocation
#[derive(Debug)]
pub struct PipelineReport {
    pub outcome: RunOutcome,
    pub units: Vec<UnitResult>,
}

impl PipelineReport {
    pub fn unit(&self, id: &str) -> Option<&UnitResult> {
        self.units.iter().find(|u| u.unit == id)
    }
}

/// Combine the per-job and global core limits.
///
/// A per-job limit above the global one is clamped to it.
pub fn resolve_max_cores(per_job: Option<u32>, global: Option<u32>) -> Option<u32> {
    match (per_job, global) {
        (Some(job), Some(global)) if job > global => {
            warn!(
                per_job = job,
                global, "Per-job core limit exceeds the global limit; clamping"
            );
            Some(global)
        }
        (job, _) => job,
    }
}

/// Runs pipelines built from a toolkit
pub struct Orchestrator {
    toolkit: Arc<dyn Toolkit>,
    context: RunContext,
    runs_dir: Option<PathBuf>,
    max_cores_per_job: Option<u32>,
    max_cores: Option<u32>,
}

impl Orchestrator {
    pub fn new(toolkit: Arc<dyn Toolkit>, context: RunContext) -> Self {
        Self {
            toolkit,
            context,
            runs_dir: None,
            max_cores_per_job: None,
            max_cores: None,
        }
    }

    /// Record the run journal under `runs_dir`
    pub fn with_journal(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Core limits from the command line
    pub fn with_core_limits(mut self, per_job: Option<u32>, global: Option<u32>) -> Self {
        self.max_cores_per_job = per_job;
        self.max_cores = global;
        self
    }

    pub async fn run_file(&self, path: &Path) -> Result<PipelineReport, PipelineError> {
        let config = self.resolver().resolve_file(path).await?;
        self.run_resolved(config).await
    }

    pub async fn run_str(&self, yaml: &str) -> Result<PipelineReport, PipelineError> {
        let config = self.resolver().resolve_str(yaml).await?;
        self.run_resolved(config).await
    }

    /// Build every unit, then run them all on one engine
    #[instrument(skip_all, fields(units = config.units.len()))]
    pub async fn run_resolved(&self, mut config: ResolvedConfig) -> Result<PipelineReport, PipelineError> {
        if let Some(global) = self.max_cores {
            if config.shared.max_cores > global {
                warn!(
                    configured = config.shared.max_cores,
                    global, "Configured core limit exceeds the global limit; clamping"
                );
                config.shared.max_cores = global;
            }
        }

        let builder = TaskGraphBuilder::new(Arc::clone(&self.toolkit), self.context.clone(), &config);
        let mut graph = TaskGraph::new();
        let mut units = Vec::with_capacity(config.units.len());
        for unit in &config.units {
            let built = builder
                .build(&mut graph, unit)
                .await
                .map_err(|source| PipelineError::Build {
                    unit: unit.id.clone(),
                    source,
                })?;
            units.push(built);
        }

        let budget = config.shared.max_cores;
        info!(
            tasks = graph.len(),
            cores = budget,
            cpu_share = builder.cpu_share(),
            "Pipeline graph built"
        );

        let mut engine = Engine::new(self.context.clone().with_max_cores(budget));
        if let Some(runs_dir) = &self.runs_dir {
            engine = engine.with_journal(runs_dir.clone());
        }
        let outcome = engine.run(graph).await?;

        let units = units
            .into_iter()
            .map(|unit| collect_result(&outcome, unit))
            .collect::<Result<Vec<_>, _>>()?;
        info!(run_id = %outcome.run_id(), units = units.len(), "Pipeline completed");
        Ok(PipelineReport { outcome, units })
    }

    fn resolver(&self) -> ConfigResolver {
        let max_cores = resolve_max_cores(self.max_cores_per_job, self.max_cores);
        ConfigResolver::new(self.context.fetcher())
            .require_tools(self.toolkit.required_tools())
            .max_cores(max_cores)
    }
}

fn collect_result(outcome: &RunOutcome, unit: UnitGraph) -> Result<UnitResult, PipelineError> {
    let output = outcome
        .resolved_output(unit.aggregate.id())
        .map_err(|source| PipelineError::MissingResult {
            unit: unit.unit.clone(),
            source,
        })?;
    Ok(UnitResult {
        unit: unit.unit,
        root: unit.root.id(),
        aggregate: unit.aggregate.id(),
        output,
    })
}

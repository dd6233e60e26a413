//! Per-unit task graph construction.
//!
//! Every unit of work gets the same topology:
//!
//! ```text
//!             unit:<id>
//!           /     |     \            children
//!  prepare:a  prepare:b  ...
//!                 |                  follow-on of unit:<id>
//!              fan_out   (encapsulated; spawns N children at runtime)
//!                 |                  external follow-on of the fan_out group
//!               merge
//!                 |                  child
//!             aggregate
//! ```
//!
//! What the stages actually do comes from a [`Toolkit`]. The builder only
//! decides the wiring, the resource requests and how each input reaches its
//! task: config literals are passed as values, location references are
//! fetched into the artifact store while building, and upstream results are
//! passed as promises.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};

use super::context::{available_cores, RunContext};
use super::fetch::FetchError;
use super::graph::{GraphError, TaskGraph};
use super::resolver::{ConfigError, ResolvedConfig, SharedOptions, ToolOptions, UnitConfig};
use super::task::{Input, TaskBody, TaskContext, TaskRef, TaskSpec};

/// Stage kinds whose bodies are known to use many cores
pub const HIGHLY_PARALLEL: &[StageKind] = &[StageKind::Prepare];

/// Errors building a unit's graph
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unit '{unit}': failed to fetch input '{category}': {source}")]
    Fetch {
        unit: String,
        category: String,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Kind of a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Prepare,
    FanOut,
    Merge,
    Aggregate,
}

impl StageKind {
    /// Tool section a stage reads its options from
    pub fn section(self) -> &'static str {
        match self {
            StageKind::Prepare => "prepare",
            StageKind::FanOut => "fan_out",
            StageKind::Merge => "merge",
            StageKind::Aggregate => "aggregate",
        }
    }

    pub fn is_highly_parallel(self) -> bool {
        HIGHLY_PARALLEL.contains(&self)
    }
}

/// One stage of the per-unit topology
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare { category: String },
    FanOut,
    Merge,
    Aggregate,
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Prepare { .. } => StageKind::Prepare,
            Stage::FanOut => StageKind::FanOut,
            Stage::Merge => StageKind::Merge,
            Stage::Aggregate => StageKind::Aggregate,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Prepare { category } => write!(f, "prepare:{}", category),
            other => f.write_str(other.kind().section()),
        }
    }
}

/// An input category a toolkit understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSlot {
    pub category: String,
    /// Units must provide it
    pub required: bool,
    /// Passed as a plain value instead of being fetched
    pub literal: bool,
}

impl InputSlot {
    pub fn required(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            required: true,
            literal: false,
        }
    }

    pub fn optional(category: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(category)
        }
    }

    pub fn literal(mut self) -> Self {
        self.literal = true;
        self
    }
}

/// Supplies the stage bodies of a pipeline
pub trait Toolkit: Send + Sync {
    /// Input categories units may declare
    fn input_slots(&self) -> Vec<InputSlot>;

    /// Tool sections the configuration must contain
    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }

    /// Body for a stage
    fn body(&self, stage: &Stage) -> Arc<dyn TaskBody>;
}

/// Cores given to highly parallel tasks.
///
/// Half the machine, but at least six cores where the machine has them,
/// capped by the configured maximum.
pub fn cpu_share(available: u32, max_cores: Option<u32>) -> u32 {
    let share = (available / 2).max(available.min(6));
    max_cores.map_or(share, |max| share.min(max)).max(1)
}

/// Tasks of one unit's graph
#[derive(Debug, Clone)]
pub struct UnitGraph {
    pub unit: String,
    pub root: TaskRef,
    pub prepare: BTreeMap<String, TaskRef>,
    pub fan_out: TaskRef,
    pub merge: TaskRef,
    pub aggregate: TaskRef,
}

/// Root body: reports what the unit was built with
struct LaunchBody;

#[async_trait]
impl TaskBody for LaunchBody {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        debug!(unit = ctx.unit().unwrap_or("-"), "Launching unit");
        Ok(json!({ "unit": ctx.unit(), "inputs": ctx.inputs() }))
    }
}

/// Wires a unit's tasks into a graph
pub struct TaskGraphBuilder {
    toolkit: Arc<dyn Toolkit>,
    context: RunContext,
    shared: SharedOptions,
    tools: ToolOptions,
    cpu_share: u32,
}

impl TaskGraphBuilder {
    pub fn new(toolkit: Arc<dyn Toolkit>, context: RunContext, config: &ResolvedConfig) -> Self {
        let cpu_share = cpu_share(available_cores(), Some(config.shared.max_cores));
        Self {
            toolkit,
            context,
            shared: config.shared.clone(),
            tools: config.tools.clone(),
            cpu_share,
        }
    }

    /// Override the machine core count used for the cpu share
    pub fn with_available_cores(mut self, available: u32) -> Self {
        self.cpu_share = cpu_share(available, Some(self.shared.max_cores));
        self
    }

    pub fn cpu_share(&self) -> u32 {
        self.cpu_share
    }

    /// Add one unit's tasks to `graph`
    #[instrument(skip(self, graph, unit), fields(unit = %unit.id))]
    pub async fn build(&self, graph: &mut TaskGraph, unit: &UnitConfig) -> Result<UnitGraph, BuildError> {
        let slots = self.check_inputs(unit)?;
        let shared = self.shared.to_value();

        let mut root_spec = TaskSpec::with_body(format!("unit:{}", unit.id), Arc::new(LaunchBody))
            .unit(unit.id.clone());
        let mut inputs = Vec::with_capacity(unit.inputs.len());
        for (category, reference) in &unit.inputs {
            let input = if slots[category].literal {
                Input::Value(Value::from(reference.clone()))
            } else {
                self.fetch_input(unit, category, reference).await?
            };
            root_spec = root_spec.input(category.clone(), input.clone());
            inputs.push((category.clone(), input));
        }
        let root = graph.add_root(root_spec);

        let mut prepare = BTreeMap::new();
        for (category, input) in inputs {
            let stage = Stage::Prepare {
                category: category.clone(),
            };
            let spec = self
                .stage_spec(&stage, unit, &shared)
                .input("category", Value::from(category.clone()))
                .input("input", input);
            prepare.insert(category, graph.add_child(&root, spec)?);
        }

        let mut fan_out_spec = self.stage_spec(&Stage::FanOut, unit, &shared);
        for (category, task) in &prepare {
            fan_out_spec = fan_out_spec.input(format!("prepared:{}", category), task);
        }
        let fan_out = graph.add_follow_on(&root, fan_out_spec)?;
        graph.encapsulate(&fan_out)?;

        let merge_spec = self
            .stage_spec(&Stage::Merge, unit, &shared)
            .input("fanned", &fan_out);
        let merge = graph.add_follow_on(&fan_out, merge_spec)?;

        let aggregate_spec = self
            .stage_spec(&Stage::Aggregate, unit, &shared)
            .input("merged", &merge);
        let aggregate = graph.add_child(&merge, aggregate_spec)?;

        debug!(prepare = prepare.len(), "Unit graph built");
        Ok(UnitGraph {
            unit: unit.id.clone(),
            root,
            prepare,
            fan_out,
            merge,
            aggregate,
        })
    }

    /// Every declared category is known and every required one is present
    fn check_inputs(&self, unit: &UnitConfig) -> Result<BTreeMap<String, InputSlot>, ConfigError> {
        let slots: BTreeMap<String, InputSlot> = self
            .toolkit
            .input_slots()
            .into_iter()
            .map(|slot| (slot.category.clone(), slot))
            .collect();

        if let Some(unknown) = unit.inputs.keys().find(|c| !slots.contains_key(*c)) {
            return Err(ConfigError::Invalid(format!(
                "unit '{}' declares unrecognised input category '{}'",
                unit.id, unknown
            )));
        }

        let missing: Vec<String> = slots
            .values()
            .filter(|slot| slot.required && !unit.inputs.contains_key(&slot.category))
            .map(|slot| slot.category.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys {
                section: format!("unit '{}'", unit.id),
                keys: missing,
            });
        }

        Ok(slots)
    }

    async fn fetch_input(&self, unit: &UnitConfig, category: &str, reference: &str) -> Result<Input, BuildError> {
        let credentials = self.shared.credentials();
        let handle = self
            .context
            .fetcher()
            .fetch(reference, credentials.as_ref())
            .await
            .map_err(|source| BuildError::Fetch {
                unit: unit.id.clone(),
                category: category.to_string(),
                source,
            })?;
        Ok(Input::Artifact(handle))
    }

    fn stage_spec(&self, stage: &Stage, unit: &UnitConfig, shared: &Value) -> TaskSpec {
        let kind = stage.kind();
        let mut spec = TaskSpec::with_body(stage.to_string(), self.toolkit.body(stage))
            .unit(unit.id.clone())
            .input("unit", Value::from(unit.id.clone()))
            .input("shared", shared.clone())
            .input("options", self.options_for(kind));
        if kind.is_highly_parallel() {
            spec = spec.cores(self.cpu_share);
        }
        spec
    }

    /// Tool section of a stage as one JSON object; artifacts become handle strings
    fn options_for(&self, kind: StageKind) -> Value {
        let mut options = Map::new();
        if let Some(section) = self.tools.get(kind.section()) {
            for (name, input) in section {
                let value = match input {
                    Input::Value(value) => value.clone(),
                    Input::Artifact(handle) => handle.to_value(),
                    Input::Promise(promise) => promise.to_value(),
                };
                options.insert(name.clone(), value);
            }
        }
        Value::Object(options)
    }
}

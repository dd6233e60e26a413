//! Toolkit whose stages are shell commands.
//!
//! The `pipeline` section of a configuration names the input categories and
//! the command run by each stage:
//!
//! ```yaml
//! pipeline:
//!   inputs: [tumor_dna, normal_dna]
//!   optional_inputs: [rna]
//!   literal_inputs: []            # categories passed as plain strings
//!   prepare: ./prepare.sh
//!   fan_out: ./split.sh           # prints a JSON array
//!   shard: ./call.sh              # runs once per array element
//!   merge: ./merge.sh
//!   aggregate: ./report.sh
//!   timeout_seconds: 3600
//! ```
//!
//! Each command receives a JSON request on stdin (task name, unit, granted
//! cores, a scratch directory and the resolved inputs, with artifacts
//! exported to files in the scratch directory) and prints its JSON result
//! on stdout. A result may declare files to keep with `{"$file": "path"}`;
//! those are stored and replaced by artifact handles. Stages without a
//! command pass their main input through unchanged.

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{Adapter, CommandAdapter};
use crate::core::builder::{InputSlot, Stage, Toolkit};
use crate::core::task::{TaskBody, TaskContext, TaskSpec};
use crate::domain::ArtifactHandle;

/// Key of an output file declaration
pub const FILE_MARKER: &str = "$file";

const HANDLE_PREFIX: &str = "artifact:";

fn default_timeout() -> u64 {
    3600
}

/// The `pipeline` section of a configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineCommands {
    /// Required input categories
    pub inputs: Vec<String>,
    #[serde(default)]
    pub optional_inputs: Vec<String>,
    #[serde(default)]
    pub literal_inputs: Vec<String>,
    #[serde(default)]
    pub prepare: Option<String>,
    pub fan_out: String,
    #[serde(default)]
    pub shard: Option<String>,
    #[serde(default)]
    pub merge: Option<String>,
    #[serde(default)]
    pub aggregate: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Further tool sections the commands rely on
    #[serde(default)]
    pub tools: Vec<String>,
}

impl PipelineCommands {
    pub const SECTION: &'static str = "pipeline";

    /// Read the `pipeline` section out of a configuration document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(text).context("Configuration is not valid YAML")?;
        let section = document
            .get(Self::SECTION)
            .with_context(|| format!("Configuration has no '{}' section", Self::SECTION))?;
        serde_yaml::from_value(section.clone())
            .with_context(|| format!("Invalid '{}' section", Self::SECTION))
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read configuration: {}", path.display()))?;
        Self::from_yaml(&text)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// [`Toolkit`] running each stage as a shell command
pub struct CommandToolkit {
    commands: Arc<PipelineCommands>,
    adapter: Arc<dyn Adapter>,
}

impl CommandToolkit {
    pub fn new(commands: PipelineCommands) -> Self {
        Self::with_adapter(commands, Arc::new(CommandAdapter::new()))
    }

    pub fn with_adapter(commands: PipelineCommands, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            commands: Arc::new(commands),
            adapter,
        }
    }

    fn stage_body(&self, command: Option<&String>, passthrough: &'static str) -> Arc<dyn TaskBody> {
        Arc::new(CommandBody {
            adapter: Arc::clone(&self.adapter),
            command: command.cloned(),
            passthrough,
            timeout: self.commands.timeout(),
        })
    }
}

impl Toolkit for CommandToolkit {
    fn input_slots(&self) -> Vec<InputSlot> {
        let literal = |slot: InputSlot| {
            if self.commands.literal_inputs.contains(&slot.category) {
                slot.literal()
            } else {
                slot
            }
        };
        self.commands
            .inputs
            .iter()
            .map(InputSlot::required)
            .chain(self.commands.optional_inputs.iter().map(InputSlot::optional))
            .map(literal)
            .collect()
    }

    fn required_tools(&self) -> Vec<String> {
        let mut tools = vec![PipelineCommands::SECTION.to_string()];
        tools.extend(self.commands.tools.iter().cloned());
        tools
    }

    fn body(&self, stage: &Stage) -> Arc<dyn TaskBody> {
        match stage {
            Stage::Prepare { .. } => self.stage_body(self.commands.prepare.as_ref(), "input"),
            Stage::FanOut => Arc::new(FanOutBody {
                adapter: Arc::clone(&self.adapter),
                command: self.commands.fan_out.clone(),
                shard: self.stage_body(self.commands.shard.as_ref(), "item"),
                timeout: self.commands.timeout(),
            }),
            Stage::Merge => self.stage_body(self.commands.merge.as_ref(), "fanned"),
            Stage::Aggregate => self.stage_body(self.commands.aggregate.as_ref(), "merged"),
        }
    }
}

/// Runs one command, or passes an input through when there is none
struct CommandBody {
    adapter: Arc<dyn Adapter>,
    command: Option<String>,
    passthrough: &'static str,
    timeout: Duration,
}

#[async_trait]
impl TaskBody for CommandBody {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        match &self.command {
            Some(command) => invoke(self.adapter.as_ref(), ctx, command, self.timeout).await,
            None => Ok(ctx.require(self.passthrough)?.clone()),
        }
    }
}

/// Runs the fan-out command and spawns one shard per element it prints
struct FanOutBody {
    adapter: Arc<dyn Adapter>,
    command: String,
    shard: Arc<dyn TaskBody>,
    timeout: Duration,
}

#[async_trait]
impl TaskBody for FanOutBody {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        let items = match invoke(self.adapter.as_ref(), ctx, &self.command, self.timeout).await? {
            Value::Array(items) => items,
            other => bail!(
                "fan-out command '{}' must print a JSON array, got {}",
                self.command,
                kind_of(&other)
            ),
        };

        let shared = ctx.input("shared").cloned().unwrap_or(Value::Null);
        let mut shards = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let spec = TaskSpec::with_body(format!("shard:{}", index), Arc::clone(&self.shard))
                .input("index", Value::from(index))
                .input("item", item)
                .input("shared", shared.clone());
            shards.push(ctx.add_child(spec).to_value());
        }
        info!(task = ctx.name(), shards = shards.len(), "Fanned out");
        Ok(Value::Array(shards))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Run `command` with the task's request on stdin and parse its result
async fn invoke(adapter: &dyn Adapter, ctx: &TaskContext, command: &str, limit: Duration) -> Result<Value> {
    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
    let store = ctx.run_context().store();

    let request = json!({
        "task": ctx.name(),
        "unit": ctx.unit(),
        "cores": ctx.cores(),
        "work_dir": scratch.path(),
        "inputs": ctx.inputs(),
    });

    let mut handles = BTreeSet::new();
    collect_handles(&request, &mut handles);
    let mut exported = HashMap::new();
    for handle in handles {
        let dest = scratch.path().join(handle.digest());
        store.export(&handle, &dest).await?;
        exported.insert(handle.to_string(), dest.display().to_string());
    }
    let request = rewrite(&request, &|value| {
        value
            .as_str()
            .and_then(|s| exported.get(s))
            .map(|path| Value::from(path.clone()))
    });

    debug!(task = ctx.name(), command, artifacts = exported.len(), "Running stage command");
    let payload = serde_json::to_string(&request)?;
    let output = adapter.execute(command, &payload, limit).await?;
    let result: Value = if output.content.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&output.content)
            .with_context(|| format!("Command '{}' did not print JSON", command))?
    };

    let mut files = Vec::new();
    collect_files(&result, &mut files);
    let mut stored = HashMap::new();
    for file in files {
        let path = declared_file(scratch.path(), &file)
            .await
            .with_context(|| format!("Command '{}' declared file '{}'", command, file))?;
        let handle = store
            .put_file(&path)
            .await
            .with_context(|| format!("Command '{}' declared missing file '{}'", command, file))?;
        stored.insert(file, handle);
    }
    Ok(rewrite(&result, &|value| {
        file_marker(value)
            .and_then(|file| stored.get(file))
            .map(ArtifactHandle::to_value)
    }))
}

/// Resolve a declared output file; it must stay inside the scratch directory
async fn declared_file(scratch: &Path, file: &str) -> Result<PathBuf> {
    let relative = Path::new(file);
    if relative.as_os_str().is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("output files must be relative paths inside the scratch directory");
    }

    let root = tokio::fs::canonicalize(scratch)
        .await
        .context("Failed to resolve scratch directory")?;
    let resolved = tokio::fs::canonicalize(scratch.join(relative))
        .await
        .context("file does not exist")?;
    if !resolved.starts_with(&root) {
        bail!("output file resolves outside the scratch directory");
    }
    Ok(resolved)
}

fn collect_handles(value: &Value, out: &mut BTreeSet<ArtifactHandle>) {
    match value {
        Value::String(s) if s.starts_with(HANDLE_PREFIX) => {
            if let Ok(handle) = s.parse() {
                out.insert(handle);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_handles(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_handles(item, out)),
        _ => {}
    }
}

fn file_marker(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(FILE_MARKER).and_then(Value::as_str),
        _ => None,
    }
}

fn collect_files(value: &Value, out: &mut Vec<String>) {
    if let Some(file) = file_marker(value) {
        out.push(file.to_string());
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_files(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_files(item, out)),
        _ => {}
    }
}

/// Copy of `value` with every node `replace` maps swapped out
fn rewrite<F>(value: &Value, replace: &F) -> Value
where
    F: Fn(&Value) -> Option<Value>,
{
    if let Some(replaced) = replace(value) {
        return replaced;
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|item| rewrite(item, replace)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite(v, replace)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

//! Task declarations and the body contract.
//!
//! A [`TaskSpec`] names a body, its resource request and its inputs. Bodies
//! implement [`TaskBody`]; they receive their resolved inputs through a
//! [`TaskContext`], which is also how they spawn new tasks at runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::context::RunContext;
use super::graph::{GraphError, IdAllocator, Relation, TaskGraph};
use super::promise::Promise;
use crate::domain::{ArtifactHandle, TaskId};

/// Advisory resource request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    /// Cores reserved from the run's budget while the body runs
    pub cores: u32,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: 1,
            memory_bytes: None,
            disk_bytes: None,
        }
    }
}

/// A value a task reads
#[derive(Debug, Clone)]
pub enum Input {
    /// Available now (config literal or local value)
    Value(Value),
    /// Fetched into the artifact store while the graph was built
    Artifact(ArtifactHandle),
    /// Produced later by another task
    Promise(Promise),
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Value(value)
    }
}

impl From<ArtifactHandle> for Input {
    fn from(handle: ArtifactHandle) -> Self {
        Input::Artifact(handle)
    }
}

impl From<Promise> for Input {
    fn from(promise: Promise) -> Self {
        Input::Promise(promise)
    }
}

impl From<&TaskRef> for Input {
    fn from(task: &TaskRef) -> Self {
        Input::Promise(task.promise())
    }
}

/// Handle to a task added to a graph
#[derive(Debug, Clone)]
pub struct TaskRef {
    id: TaskId,
    promise: Promise,
}

impl TaskRef {
    pub(crate) fn new(id: TaskId, promise: Promise) -> Self {
        Self { id, promise }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Promise of this task's output
    pub fn promise(&self) -> Promise {
        self.promise.clone()
    }

    /// Placeholder for this task's output, for embedding in another output
    pub fn to_value(&self) -> Value {
        self.promise.to_value()
    }
}

/// Executable work of a task
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// Run with resolved inputs; the returned value resolves the task's promise
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value>;
}

/// Body built from a synchronous closure
pub struct FnBody<F>(F);

impl<F> FnBody<F>
where
    F: Fn(&mut TaskContext) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> TaskBody for FnBody<F>
where
    F: Fn(&mut TaskContext) -> Result<Value> + Send + Sync,
{
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        (self.0)(ctx)
    }
}

/// Declaration of one task
#[derive(Clone)]
pub struct TaskSpec {
    name: String,
    unit: Option<String>,
    body: Arc<dyn TaskBody>,
    resources: Resources,
    inputs: BTreeMap<String, Input>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("resources", &self.resources)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, body: impl TaskBody + 'static) -> Self {
        Self::with_body(name, Arc::new(body))
    }

    pub fn with_body(name: impl Into<String>, body: Arc<dyn TaskBody>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            body,
            resources: Resources::default(),
            inputs: BTreeMap::new(),
        }
    }

    /// Tag the task with the unit of work it belongs to
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.resources.cores = cores.max(1);
        self
    }

    pub fn memory(mut self, bytes: u64) -> Self {
        self.resources.memory_bytes = Some(bytes);
        self
    }

    pub fn disk(mut self, bytes: u64) -> Self {
        self.resources.disk_bytes = Some(bytes);
        self
    }

    /// Add a named input
    pub fn input(mut self, name: impl Into<String>, input: impl Into<Input>) -> Self {
        self.inputs.insert(name.into(), input.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_id(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn resources(&self) -> Resources {
        self.resources
    }

    pub fn inputs(&self) -> &BTreeMap<String, Input> {
        &self.inputs
    }

    pub(crate) fn body(&self) -> Arc<dyn TaskBody> {
        Arc::clone(&self.body)
    }

    /// Tasks whose promises this spec reads
    pub(crate) fn promise_producers(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.inputs.values().filter_map(|input| match input {
            Input::Promise(p) => Some(p.producer()),
            _ => None,
        })
    }
}

/// What a running body sees
pub struct TaskContext {
    id: TaskId,
    name: String,
    unit: Option<String>,
    cores: u32,
    inputs: BTreeMap<String, Value>,
    run: RunContext,
    spawned: TaskGraph,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        spec: &TaskSpec,
        cores: u32,
        inputs: BTreeMap<String, Value>,
        run: RunContext,
        ids: IdAllocator,
    ) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            unit: spec.unit.clone(),
            cores,
            inputs,
            run,
            spawned: TaskGraph::spawn_batch(ids, id),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Cores granted from the run budget
    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    /// All resolved inputs; artifacts appear as `artifact:<digest>` strings
    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Input that must be present
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.inputs
            .get(name)
            .ok_or_else(|| anyhow!("task '{}' has no input '{}'", self.name, name))
    }

    /// Input that must be an artifact handle
    pub fn artifact(&self, name: &str) -> Result<ArtifactHandle> {
        let value = self.require(name)?;
        ArtifactHandle::from_value(value)
            .with_context(|| format!("input '{}' of task '{}' is not an artifact", name, self.name))
    }

    /// Spawn a task that starts when this body returns
    pub fn add_child(&mut self, spec: TaskSpec) -> TaskRef {
        let spec = self.inherit_unit(spec);
        self.spawned.attach_internal(self.id, Relation::Child, spec)
    }

    /// Spawn a task that starts after this task's children's subtrees finish
    pub fn add_follow_on(&mut self, spec: TaskSpec) -> TaskRef {
        let spec = self.inherit_unit(spec);
        self.spawned.attach_internal(self.id, Relation::FollowOn, spec)
    }

    /// Spawn a child of a task spawned earlier by this body
    pub fn add_child_of(&mut self, parent: &TaskRef, spec: TaskSpec) -> Result<TaskRef, GraphError> {
        let spec = self.inherit_unit(spec);
        if parent.id() == self.id {
            return Ok(self.add_child(spec));
        }
        self.spawned.add_child(parent, spec)
    }

    /// Spawn a follow-on of a task spawned earlier by this body
    pub fn add_follow_on_to(&mut self, parent: &TaskRef, spec: TaskSpec) -> Result<TaskRef, GraphError> {
        let spec = self.inherit_unit(spec);
        if parent.id() == self.id {
            return Ok(self.add_follow_on(spec));
        }
        self.spawned.add_follow_on(parent, spec)
    }

    /// Encapsulate a task spawned earlier by this body
    pub fn encapsulate(&mut self, task: &TaskRef) -> Result<(), GraphError> {
        self.spawned.encapsulate(task)
    }

    /// Number of tasks spawned so far
    pub fn spawned(&self) -> usize {
        self.spawned.len()
    }

    pub(crate) fn into_spawned(self) -> TaskGraph {
        self.spawned
    }

    fn inherit_unit(&self, spec: TaskSpec) -> TaskSpec {
        match (&spec.unit, &self.unit) {
            (None, Some(unit)) => spec.unit(unit.clone()),
            _ => spec,
        }
    }
}

//! Task graph execution.
//!
//! A single coordinator owns the scheduling state. Bodies run on tokio
//! tasks and report back over a channel, so every completion (and every
//! counter update it causes) is applied by the coordinator alone.
//!
//! Dispatch is first-come-first-served among ready tasks, skipping over any
//! task whose core request does not fit in what is left of the budget.
//! Once a task fails nothing new is started: running bodies drain, their
//! results are discarded, and everything that never started is cancelled.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::context::RunContext;
use super::event_store::EventStore;
use super::graph::{GraphError, IdAllocator, Inserted, LiveGraph, TaskGraph};
use super::promise::{substitute, PromiseError};
use super::task::{Input, TaskContext, TaskSpec};
use crate::domain::{Event, EventType, Run, TaskId, TaskState};

/// Task failure as returned by the body; `downcast_ref` reaches the original error
pub type TaskError = anyhow::Error;

/// Why a run did not complete
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run {run_id}: invalid task graph: {source}")]
    Graph {
        run_id: Uuid,
        #[source]
        source: GraphError,
    },

    #[error("run {run_id}: task '{task_name}' ({task_id}) of unit {} failed: {source}", unit_label(.unit))]
    TaskFailed {
        run_id: Uuid,
        task_id: TaskId,
        task_name: String,
        unit: Option<String>,
        #[source]
        source: TaskError,
    },

    #[error("run {run_id} stalled with {} task(s) that can never become ready", .pending.len())]
    Stalled { run_id: Uuid, pending: Vec<TaskId> },
}

fn unit_label(unit: &Option<String>) -> &str {
    unit.as_deref().unwrap_or("-")
}

impl RunError {
    /// Task that failed, if the run failed because of one
    pub fn failed_task(&self) -> Option<TaskId> {
        match self {
            RunError::TaskFailed { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// Unit of work the failing task belonged to
    pub fn unit(&self) -> Option<&str> {
        match self {
            RunError::TaskFailed { unit, .. } => unit.as_deref(),
            _ => None,
        }
    }

    /// Error returned by the failing task's body
    pub fn task_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            RunError::TaskFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunOutcome {
    /// Journal-derived state of the run
    pub run: Run,
    /// Every event in the order it was recorded
    pub events: Vec<Event>,
    outputs: HashMap<TaskId, Arc<Value>>,
    error: Option<RunError>,
}

impl RunOutcome {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&RunError> {
        self.error.as_ref()
    }

    /// Raw output of a completed task (placeholders left in place)
    pub fn output(&self, task: TaskId) -> Option<&Value> {
        self.outputs.get(&task).map(|v| v.as_ref())
    }

    /// Output of a completed task with every embedded promise substituted
    pub fn resolved_output(&self, task: TaskId) -> Result<Value, PromiseError> {
        let lookup = |id: TaskId| self.outputs.get(&id).cloned();
        let raw = self.outputs.get(&task).ok_or(PromiseError::Unresolved(task))?;
        substitute(raw, &lookup)
    }

    /// Position and event of the first `kind` event for `task`
    pub fn event_for(&self, task: TaskId, kind: EventType) -> Option<(usize, &Event)> {
        self.events
            .iter()
            .enumerate()
            .find(|(_, e)| e.task_id == Some(task) && e.event_type == kind)
    }

    pub fn into_result(mut self) -> Result<Self, RunError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Executes task graphs against a run context
pub struct Engine {
    context: RunContext,
    journal_dir: Option<PathBuf>,
}

impl Engine {
    pub fn new(context: RunContext) -> Self {
        Self {
            context,
            journal_dir: None,
        }
    }

    /// Also append every event to `<runs_dir>/<run id>/events.jsonl`
    pub fn with_journal(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(runs_dir.into());
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Run a graph to completion, failing with the first fatal error
    pub async fn run(&self, graph: TaskGraph) -> Result<RunOutcome, RunError> {
        self.execute(graph).await.into_result()
    }

    /// Run a graph to completion and return everything it produced
    #[instrument(skip_all, fields(tasks = graph.len()))]
    pub async fn execute(&self, graph: TaskGraph) -> RunOutcome {
        let run_id = Uuid::new_v4();

        let journal = match &self.journal_dir {
            Some(dir) => match EventStore::open_in(dir, run_id).await {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(%run_id, error = %e, "Run journal unavailable; events kept in memory only");
                    None
                }
            },
            None => None,
        };

        let coordinator = Coordinator {
            run_id,
            context: self.context.clone(),
            ids: graph.ids().clone(),
            live: LiveGraph::default(),
            outputs: HashMap::new(),
            ready: VecDeque::new(),
            running: HashMap::new(),
            used_cores: 0,
            failure: None,
            recorder: Recorder {
                run: Run::new(run_id),
                events: Vec::new(),
                journal,
            },
        };
        coordinator.drive(graph).await
    }
}

struct Completion {
    id: TaskId,
    result: anyhow::Result<(Value, TaskGraph)>,
}

struct Running {
    cores: u32,
    started: Instant,
}

struct Recorder {
    run: Run,
    events: Vec<Event>,
    journal: Option<EventStore>,
}

impl Recorder {
    async fn record(&mut self, event: Event) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&event).await {
                warn!(error = %e, "Failed to append to run journal; continuing without it");
                self.journal = None;
            }
        }
        self.run.apply_event(&event);
        self.events.push(event);
    }
}

struct Coordinator {
    run_id: Uuid,
    context: RunContext,
    ids: IdAllocator,
    live: LiveGraph,
    outputs: HashMap<TaskId, Arc<Value>>,
    ready: VecDeque<TaskId>,
    running: HashMap<TaskId, Running>,
    used_cores: u32,
    failure: Option<RunError>,
    recorder: Recorder,
}

impl Coordinator {
    async fn drive(mut self, graph: TaskGraph) -> RunOutcome {
        info!(
            run_id = %self.run_id,
            tasks = graph.len(),
            max_cores = self.context.max_cores(),
            "Starting run"
        );
        let summary = format!("Run started with {} task(s)", graph.len());
        self.recorder
            .record(Event::run(self.run_id, EventType::RunStarted, summary, TaskState::Running))
            .await;

        match self.live.insert(graph, None) {
            Ok(inserted) => self.admit(inserted).await,
            Err(source) => {
                self.failure = Some(RunError::Graph {
                    run_id: self.run_id,
                    source,
                })
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        loop {
            if self.failure.is_none() {
                self.dispatch(&tx).await;
            }
            if self.running.is_empty() {
                break;
            }
            let Some(completion) = rx.recv().await else {
                break;
            };
            self.on_completion(completion).await;
        }

        self.finish().await
    }

    /// Record newly inserted tasks and queue the ready ones
    async fn admit(&mut self, inserted: Inserted) {
        for id in inserted.added {
            let (name, unit) = self.describe(id);
            self.recorder
                .record(Event::task(self.run_id, id, &name, unit.as_deref(), EventType::TaskAdded, TaskState::Pending))
                .await;
        }
        self.release(inserted.ready).await;
    }

    async fn release(&mut self, ready: Vec<TaskId>) {
        for id in ready {
            let (name, unit) = self.describe(id);
            debug!(task = %id, %name, "Task ready");
            self.recorder
                .record(Event::task(self.run_id, id, &name, unit.as_deref(), EventType::TaskReady, TaskState::Ready))
                .await;
            self.ready.push_back(id);
        }
    }

    fn grant_for(&self, id: TaskId) -> u32 {
        let max = self.context.max_cores();
        self.live.node(id).map_or(1, |n| n.cores.clamp(1, max))
    }

    async fn dispatch(&mut self, tx: &mpsc::UnboundedSender<Completion>) {
        let max = self.context.max_cores();
        while self.failure.is_none() && self.used_cores < max {
            let Some(pos) = self
                .ready
                .iter()
                .position(|&id| self.used_cores + self.grant_for(id) <= max)
            else {
                break;
            };
            if let Some(id) = self.ready.remove(pos) {
                self.start(id, tx).await;
            }
        }
    }

    async fn start(&mut self, id: TaskId, tx: &mpsc::UnboundedSender<Completion>) {
        let grant = self.grant_for(id);
        let Some(spec) = self.live.start(id) else {
            return;
        };

        let inputs = match self.resolve_inputs(&spec) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail_task(id, anyhow::Error::new(e), Duration::ZERO).await;
                return;
            }
        };

        let summary = format!("{} started on {} core(s)", spec.name(), grant);
        self.recorder
            .record(
                Event::task(self.run_id, id, spec.name(), spec.unit_id(), EventType::TaskStarted, TaskState::Running)
                    .with_summary(summary),
            )
            .await;
        debug!(task = %id, name = %spec.name(), cores = grant, "Task started");

        let ctx = TaskContext::new(id, &spec, grant, inputs, self.context.clone(), self.ids.clone());
        let body = spec.body();
        let worker = tokio::spawn(async move {
            let mut ctx = ctx;
            let value = body.run(&mut ctx).await?;
            Ok::<_, anyhow::Error>((value, ctx.into_spawned()))
        });

        let tx = tx.clone();
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(join) if join.is_panic() => Err(anyhow!("task body panicked")),
                Err(join) => Err(anyhow!("task body was aborted: {}", join)),
            };
            // The coordinator only stops listening once nothing is running
            let _ = tx.send(Completion { id, result });
        });

        self.running.insert(
            id,
            Running {
                cores: grant,
                started: Instant::now(),
            },
        );
        self.used_cores += grant;
    }

    fn resolve_inputs(&self, spec: &TaskSpec) -> Result<BTreeMap<String, Value>, PromiseError> {
        let lookup = |id: TaskId| self.outputs.get(&id).cloned();
        spec.inputs()
            .iter()
            .map(|(name, input)| {
                let value = match input {
                    Input::Value(value) => substitute(value, &lookup)?,
                    Input::Artifact(handle) => handle.to_value(),
                    Input::Promise(promise) => substitute(&promise.to_value(), &lookup)?,
                };
                Ok((name.clone(), value))
            })
            .collect()
    }

    async fn on_completion(&mut self, completion: Completion) {
        let Completion { id, result } = completion;
        let elapsed = match self.running.remove(&id) {
            Some(running) => {
                self.used_cores -= running.cores;
                running.started.elapsed()
            }
            None => Duration::ZERO,
        };

        match result {
            Ok((value, spawned)) if self.failure.is_none() => {
                if !spawned.is_empty() {
                    let count = spawned.len();
                    match self.live.insert(spawned, Some(id)) {
                        Ok(inserted) => {
                            let (name, unit) = self.describe(id);
                            info!(task = %id, %name, count, "Task spawned new tasks");
                            self.recorder
                                .record(
                                    Event::task(self.run_id, id, &name, unit.as_deref(), EventType::TasksSpawned, TaskState::Running)
                                        .with_summary(format!("{} spawned {} task(s)", name, count)),
                                )
                                .await;
                            self.admit(inserted).await;
                        }
                        Err(e) => {
                            self.fail_task(id, anyhow::Error::new(e), elapsed).await;
                            return;
                        }
                    }
                }

                let value = Arc::new(value);
                self.outputs.insert(id, Arc::clone(&value));
                let released = self.live.complete(id, value);

                let (name, unit) = self.describe(id);
                debug!(task = %id, %name, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                self.recorder
                    .record(
                        Event::task(self.run_id, id, &name, unit.as_deref(), EventType::TaskCompleted, TaskState::Completed)
                            .with_duration(elapsed.as_millis() as u64),
                    )
                    .await;
                self.release(released).await;
            }
            Ok(_) => {
                self.live.discard(id);
                let (name, unit) = self.describe(id);
                debug!(task = %id, %name, "Task completed after run failure; result discarded");
                self.recorder
                    .record(
                        Event::task(self.run_id, id, &name, unit.as_deref(), EventType::TaskCompleted, TaskState::Completed)
                            .with_summary(format!("{} completed; result discarded", name))
                            .with_duration(elapsed.as_millis() as u64),
                    )
                    .await;
            }
            Err(e) => self.fail_task(id, e, elapsed).await,
        }
    }

    async fn fail_task(&mut self, id: TaskId, err: anyhow::Error, elapsed: Duration) {
        self.live.fail(id);
        let (name, unit) = self.describe(id);
        let message = format!("{:#}", err);
        error!(run_id = %self.run_id, task = %id, %name, unit = unit_label(&unit), error = %message, "Task failed");

        self.recorder
            .record(
                Event::task(self.run_id, id, &name, unit.as_deref(), EventType::TaskFailed, TaskState::Failed)
                    .with_duration(elapsed.as_millis() as u64)
                    .with_error(message),
            )
            .await;

        if self.failure.is_none() {
            if !self.running.is_empty() {
                warn!(running = self.running.len(), "No further tasks will start; draining running tasks");
            }
            self.failure = Some(RunError::TaskFailed {
                run_id: self.run_id,
                task_id: id,
                task_name: name,
                unit,
                source: err,
            });
        }
    }

    async fn finish(mut self) -> RunOutcome {
        if self.failure.is_none() {
            let pending = self.live.unfinished();
            if !pending.is_empty() {
                self.failure = Some(RunError::Stalled {
                    run_id: self.run_id,
                    pending,
                });
            }
        }

        if self.failure.is_some() {
            self.ready.clear();
            for id in self.live.cancel_waiting() {
                let (name, unit) = self.describe(id);
                self.recorder
                    .record(Event::task(self.run_id, id, &name, unit.as_deref(), EventType::TaskCancelled, TaskState::Cancelled))
                    .await;
            }
        }

        match &self.failure {
            None => {
                info!(run_id = %self.run_id, tasks = self.recorder.run.tasks.len(), "Run completed");
                self.recorder
                    .record(Event::run(self.run_id, EventType::RunCompleted, "Run completed".into(), TaskState::Completed))
                    .await;
            }
            Some(err) => {
                let message = err.to_string();
                error!(run_id = %self.run_id, error = %message, "Run failed");
                self.recorder
                    .record(
                        Event::run(self.run_id, EventType::RunFailed, "Run failed".into(), TaskState::Failed)
                            .with_error(message),
                    )
                    .await;
            }
        }

        RunOutcome {
            run: self.recorder.run,
            events: self.recorder.events,
            outputs: self.outputs,
            error: self.failure,
        }
    }

    fn describe(&self, id: TaskId) -> (String, Option<String>) {
        match self.live.node(id) {
            Some(node) => (node.name.clone(), node.unit.clone()),
            None => (id.to_string(), None),
        }
    }
}

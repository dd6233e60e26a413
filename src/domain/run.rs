//! Run state and reconstruction from events.
//!
//! A Run is one execution of a task graph, covering every unit of work
//! scheduled into it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, TaskId, TaskState};

/// A task graph execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Every task seen in the run, static and spawned
    pub tasks: BTreeMap<TaskId, TaskRecord>,
}

/// What the journal knows about one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub unit: Option<String>,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Run {
    /// Create a new run
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            tasks: BTreeMap::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self {
            id: first_event.run_id,
            state: RunState::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            tasks: BTreeMap::new(),
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::TasksSpawned => {}
            _ => {
                let Some(task_id) = event.task_id else {
                    return;
                };
                let record = self.tasks.entry(task_id).or_insert_with(|| TaskRecord {
                    name: event.task_name.clone().unwrap_or_default(),
                    unit: event.unit.clone(),
                    state: TaskState::Pending,
                    started_at: None,
                    finished_at: None,
                    error: None,
                });
                record.state = event.status;
                match event.event_type {
                    EventType::TaskStarted => record.started_at = Some(event.timestamp),
                    EventType::TaskCompleted
                    | EventType::TaskFailed
                    | EventType::TaskCancelled => {
                        record.finished_at = Some(event.timestamp);
                        record.error = event.error.clone();
                    }
                    _ => {}
                }
            }
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// State of a task, if the journal has seen it
    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.get(&task).map(|r| r.state)
    }

    /// Number of tasks currently in the given state
    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|r| r.state == state).count()
    }

    /// Records of every task with the given name, in id order
    pub fn tasks_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (&'a TaskId, &'a TaskRecord)> {
        self.tasks.iter().filter(move |(_, r)| r.name == name)
    }
}

/// State of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Every task completed
    Completed,

    /// A task failed
    Failed { error: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

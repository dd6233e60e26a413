//! Event types for the run journal.
//!
//! Every state change of a run or one of its tasks is recorded as an
//! immutable event. Run state can be rebuilt by replaying them in order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a task, unique within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single entry in the run journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Task the event is about (None for run-level events)
    pub task_id: Option<TaskId>,

    /// Task name, for readable logs
    pub task_name: Option<String>,

    /// Unit of work the task belongs to
    pub unit: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Task (or run) state after this event
    pub status: TaskState,

    /// Time taken in milliseconds (for finished tasks)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a run-level event with the current timestamp
    pub fn run(run_id: Uuid, event_type: EventType, summary: String, status: TaskState) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            task_id: None,
            task_name: None,
            unit: None,
            event_type,
            summary,
            status,
            duration_ms: None,
            error: None,
        }
    }

    /// Create a task-level event with the current timestamp
    pub fn task(
        run_id: Uuid,
        task_id: TaskId,
        task_name: &str,
        unit: Option<&str>,
        event_type: EventType,
        status: TaskState,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            task_id: Some(task_id),
            task_name: Some(task_name.to_string()),
            unit: unit.map(str::to_string),
            event_type,
            summary: format!("{} {}", task_name, event_type.verb()),
            status,
            duration_ms: None,
            error: None,
        }
    }

    /// Attach a summary line
    pub fn with_summary(mut self, summary: String) -> Self {
        self.summary = summary;
        self
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// Every task completed
    RunCompleted,

    /// A task failed and the run drained
    RunFailed,

    /// A task was added to the graph (statically or at runtime)
    TaskAdded,

    /// All dependencies of a task completed
    TaskReady,

    /// A task body started executing
    TaskStarted,

    /// A task body returned successfully
    TaskCompleted,

    /// A task body returned an error
    TaskFailed,

    /// A task never ran because the run failed
    TaskCancelled,

    /// A running task registered new tasks
    TasksSpawned,
}

impl EventType {
    fn verb(self) -> &'static str {
        match self {
            EventType::RunStarted => "started",
            EventType::RunCompleted => "completed",
            EventType::RunFailed => "failed",
            EventType::TaskAdded => "added",
            EventType::TaskReady => "ready",
            EventType::TaskStarted => "started",
            EventType::TaskCompleted => "completed",
            EventType::TaskFailed => "failed",
            EventType::TaskCancelled => "cancelled",
            EventType::TasksSpawned => "spawned tasks",
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on dependencies
    Pending,

    /// Dependencies satisfied, waiting for a worker slot
    Ready,

    /// Body executing
    Running,

    /// Body returned a value
    Completed,

    /// Body returned an error
    Failed,

    /// Never started because the run failed first
    Cancelled,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskState {
    /// Whether the task will not change state again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

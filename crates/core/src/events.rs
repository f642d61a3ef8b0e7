use crate::types::{LogicalInterval, RunId, RunState, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's lifecycle log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events recorded for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunCreated {
        graph_name: String,
        graph_version: u32,
        interval: Option<LogicalInterval>,
    },
    RunFinished {
        state: RunState,
        error: Option<String>,
    },
    RunCancelled,

    // Task lifecycle events
    TaskQueued {
        task_id: TaskId,
        attempt: u32,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: TaskId,
        attempt: u32,
    },
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    TaskUpstreamFailed {
        task_id: TaskId,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
}

impl EventType {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EventType::TaskQueued { task_id, .. }
            | EventType::TaskStarted { task_id, .. }
            | EventType::TaskSucceeded { task_id, .. }
            | EventType::TaskFailed { task_id, .. }
            | EventType::TaskUpstreamFailed { task_id }
            | EventType::TaskSkipped { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run, oldest first
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}

use super::dag::TaskGraph;
use crate::error::{EngineError, EngineResult};
use crate::types::{LogicalInterval, RunId, RunKind, RunState, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution state of one task inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Attempts dispatched so far (1-based once queued)
    pub attempt: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskInstance {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            attempt: 0,
            retry_at: None,
            queued_at: None,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

/// One execution of a graph version for a logical interval or manual trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInstance {
    pub id: RunId,
    pub graph_name: String,
    pub graph_version: u32,
    pub kind: RunKind,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// One entry per task, in declaration order
    pub tasks: Vec<TaskInstance>,
}

impl RunInstance {
    /// Create a run with every task pending
    pub fn new(graph: &TaskGraph, kind: RunKind) -> Self {
        Self {
            id: RunId::new(),
            graph_name: graph.name().to_string(),
            graph_version: graph.version(),
            kind,
            state: RunState::Running,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            tasks: graph
                .tasks()
                .iter()
                .map(|t| TaskInstance::new(t.name.clone()))
                .collect(),
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskInstance> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    fn task_mut(&mut self, task_id: &TaskId) -> EngineResult<&mut TaskInstance> {
        let run_id = self.id;
        self.tasks
            .iter_mut()
            .find(|t| &t.task_id == task_id)
            .ok_or_else(|| EngineError::UnknownTask {
                run_id,
                task: task_id.clone(),
            })
    }

    pub fn state_of(&self, task_id: &TaskId) -> Option<TaskState> {
        self.task(task_id).map(|t| t.state)
    }

    /// Tasks currently in `state`, in declaration order
    pub fn tasks_in(&self, state: TaskState) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.state == state)
            .map(|t| t.task_id.clone())
            .collect()
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    pub fn logical_interval(&self) -> Option<LogicalInterval> {
        match &self.kind {
            RunKind::Scheduled { interval } => Some(*interval),
            RunKind::Manual { .. } => None,
        }
    }

    /// Move a task to `to`, rejecting transitions the state machine does not allow
    pub(crate) fn transition(
        &mut self,
        task_id: &TaskId,
        to: TaskState,
        now: DateTime<Utc>,
    ) -> EngineResult<TaskState> {
        let run_id = self.id;
        let task = self.task_mut(task_id)?;
        let from = task.state;

        if !is_allowed(from, to) {
            return Err(EngineError::InvalidTransition {
                run_id,
                task: task_id.clone(),
                from,
                to,
            });
        }

        task.state = to;
        match to {
            TaskState::Queued => {
                task.attempt += 1;
                task.retry_at = None;
                task.queued_at = Some(now);
            }
            TaskState::Running => task.started_at = Some(now),
            TaskState::Retrying => task.ended_at = Some(now),
            s if s.is_terminal() => task.ended_at = Some(now),
            _ => {}
        }

        Ok(from)
    }

    pub(crate) fn set_task_error(&mut self, task_id: &TaskId, error: Option<String>) -> EngineResult<()> {
        self.task_mut(task_id)?.error = error;
        Ok(())
    }

    pub(crate) fn set_retry_at(&mut self, task_id: &TaskId, at: DateTime<Utc>) -> EngineResult<()> {
        self.task_mut(task_id)?.retry_at = Some(at);
        Ok(())
    }

    pub(crate) fn finish(&mut self, state: RunState, error: Option<String>) {
        self.state = state;
        self.completed_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }
}

fn is_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;

    match (from, to) {
        (Pending, Queued | UpstreamFailed | Skipped) => true,
        (Retrying, Queued | Skipped) => true,
        (Queued, Running | Skipped) => true,
        (Running, Success | Failed | Retrying | Skipped) => true,
        _ => false,
    }
}

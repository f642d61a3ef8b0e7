//! Error taxonomy for the execution core.
//!
//! Definition errors are fatal at deploy time, scheduling errors are surfaced
//! without touching existing runs, task execution errors are recovered through
//! retries, and engine errors fail only the run they were raised for.

use crate::types::{RunId, TaskId};

/// A graph definition was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Graph name must not be empty")]
    EmptyGraphName,

    #[error("Graph '{graph}' contains a dependency cycle involving task '{task}'")]
    CycleDetected { graph: String, task: TaskId },

    #[error("Graph '{graph}' declares task '{task}' more than once")]
    DuplicateTask { graph: String, task: TaskId },

    #[error("Graph '{graph}' has an edge {upstream} -> {downstream} referencing unknown task '{unknown}'")]
    DanglingEdge {
        graph: String,
        upstream: TaskId,
        downstream: TaskId,
        unknown: TaskId,
    },
}

/// The scheduler clock is misconfigured for a graph
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Schedule period must be greater than zero: '{0}'")]
    ZeroPeriod(String),

    #[error("Scheduler storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// An operator invocation did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskExecutionError {
    #[error("Operator failed: {0}")]
    OperatorFailed(String),

    #[error("Timeout after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("No operator registered for kind '{0}'")]
    UnknownOperator(String),
}

/// Inconsistent engine state; fatal to the affected run only
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Run {run_id} has no task named '{task}'")]
    UnknownTask { run_id: RunId, task: TaskId },

    #[error("Graph '{name}' version {version} is not deployed")]
    UnknownGraph { name: String, version: u32 },

    #[error("Run {run_id} task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: RunId,
        task: TaskId,
        from: crate::types::TaskState,
        to: crate::types::TaskState,
    },

    #[error("Graph '{0}' is not deployed")]
    GraphNotDeployed(String),

    #[error(transparent)]
    Definition(#[from] GraphError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("Run driver has stopped")]
    DriverStopped,
}

impl EngineError {
    /// Internal errors fail the run they were raised for.
    ///
    /// A storage failure mid-advance leaves the persisted run behind the
    /// in-memory one, so it counts as internal too.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownTask { .. }
                | EngineError::UnknownGraph { .. }
                | EngineError::InvalidTransition { .. }
                | EngineError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_fail_the_run() {
        assert!(EngineError::Storage(anyhow::anyhow!("disk full")).is_internal());
        assert!(!EngineError::GraphNotDeployed("DAG-A".into()).is_internal());
        assert!(!EngineError::DriverStopped.is_internal());
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

//! Trigger rule evaluation.
//!
//! Each task carries one [`TriggerRule`]; a single function maps the rule and
//! the states of the task's direct upstream tasks to a [`TriggerDecision`].
//! Propagation is transitive because a task resolved to `upstream_failed` or
//! `skipped` becomes terminal and is seen by its own downstream tasks on the
//! next evaluation.

use super::dag::TaskGraph;
use super::run::RunInstance;
use crate::types::{TaskId, TaskState, TriggerRule};

/// What should happen to a pending task given its upstream states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Dependency condition satisfied, dispatch it
    Runnable,
    /// Not decidable yet, some upstream task is still in progress
    Wait,
    /// Will never run because upstream failed
    UpstreamFailed,
    /// Will never run, but not because of a failure
    Skip,
}

#[derive(Debug, Default)]
struct UpstreamCounts {
    total: usize,
    success: usize,
    failed: usize,
    skipped: usize,
    done: usize,
}

impl UpstreamCounts {
    fn tally(states: &[TaskState]) -> Self {
        let mut counts = Self {
            total: states.len(),
            ..Self::default()
        };
        for state in states {
            match state {
                TaskState::Success => counts.success += 1,
                TaskState::Failed | TaskState::UpstreamFailed => counts.failed += 1,
                TaskState::Skipped => counts.skipped += 1,
                _ => {}
            }
            if state.is_terminal() {
                counts.done += 1;
            }
        }
        counts
    }

    fn all_done(&self) -> bool {
        self.done == self.total
    }
}

/// Evaluate a trigger rule against the states of the direct upstream tasks
pub fn evaluate(rule: TriggerRule, upstream: &[TaskState]) -> TriggerDecision {
    use TriggerDecision::*;

    if upstream.is_empty() {
        return Runnable;
    }

    let c = UpstreamCounts::tally(upstream);
    match rule {
        TriggerRule::AllSuccess => {
            if c.failed > 0 {
                UpstreamFailed
            } else if c.skipped > 0 {
                Skip
            } else if c.success == c.total {
                Runnable
            } else {
                Wait
            }
        }
        TriggerRule::OneSuccess => {
            if c.success > 0 {
                Runnable
            } else if !c.all_done() {
                Wait
            } else if c.failed > 0 {
                UpstreamFailed
            } else {
                Skip
            }
        }
        TriggerRule::AllDone => {
            if c.all_done() {
                Runnable
            } else {
                Wait
            }
        }
        TriggerRule::AllFailed => {
            if c.success > 0 || c.skipped > 0 {
                Skip
            } else if c.failed == c.total {
                Runnable
            } else {
                Wait
            }
        }
        TriggerRule::OneFailed => {
            if c.failed > 0 {
                Runnable
            } else if c.all_done() {
                Skip
            } else {
                Wait
            }
        }
        TriggerRule::NoneFailed => {
            if c.failed > 0 {
                UpstreamFailed
            } else if c.all_done() {
                Runnable
            } else {
                Wait
            }
        }
    }
}

/// Decide what should happen to `task` in `run`
pub fn decide(graph: &TaskGraph, task: &TaskId, run: &RunInstance) -> TriggerDecision {
    let rule = graph
        .task(task)
        .map(|t| t.trigger_rule)
        .unwrap_or_default();

    let upstream: Vec<TaskState> = graph
        .upstream(task)
        .iter()
        .map(|up| run.state_of(up).unwrap_or(TaskState::Pending))
        .collect();

    evaluate(rule, &upstream)
}

/// Whether a pending task's dependency condition is satisfied
pub fn is_runnable(graph: &TaskGraph, task: &TaskId, run: &RunInstance) -> bool {
    run.state_of(task) == Some(TaskState::Pending)
        && decide(graph, task, run) == TriggerDecision::Runnable
}

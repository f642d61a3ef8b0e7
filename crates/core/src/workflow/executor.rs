use super::dag::TaskGraph;
use super::registry::GraphRegistry;
use super::run::RunInstance;
use super::trigger::{self, TriggerDecision};
use crate::config::{EngineConfig, SchedulerConfig};
use crate::error::{EngineError, EngineResult, TaskExecutionError};
use crate::events::{Event, EventLog, EventType};
use crate::operator::{OperatorRunner, TaskContext, TaskOutcome};
use crate::scheduler::SchedulerClock;
use crate::storage::RunStore;
use crate::types::{RunId, RunKind, RunState, TaskId, TaskState};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Result of an operator invocation, delivered back to whoever drives the run
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

pub type ReportReceiver = mpsc::UnboundedReceiver<TaskReport>;

/// Execution engine that moves run instances through the task state machine.
///
/// The engine never drives itself: callers invoke [`ExecutionEngine::advance`],
/// feed operator results back through [`ExecutionEngine::report_result`] and
/// call `advance` again. Both take `&mut RunInstance`, so a run has a single
/// writer at any time.
pub struct ExecutionEngine {
    registry: Arc<GraphRegistry>,
    runner: Arc<dyn OperatorRunner>,
    store: Arc<dyn RunStore>,
    event_log: Arc<dyn EventLog>,
    clock: SchedulerClock,
    config: EngineConfig,
    reports: mpsc::UnboundedSender<TaskReport>,
    // Cancellation signals for runs with dispatched tasks
    cancel_signals: Mutex<HashMap<RunId, watch::Sender<bool>>>,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<GraphRegistry>,
        runner: Arc<dyn OperatorRunner>,
        store: Arc<dyn RunStore>,
        event_log: Arc<dyn EventLog>,
        config: EngineConfig,
        scheduler: SchedulerConfig,
    ) -> (Self, ReportReceiver) {
        let (reports, report_rx) = mpsc::unbounded_channel();
        let clock = SchedulerClock::new(store.clone(), scheduler);

        let engine = Self {
            registry,
            runner,
            store,
            event_log,
            clock,
            config,
            reports,
            cancel_signals: Mutex::new(HashMap::new()),
        };

        (engine, report_rx)
    }

    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Create a run for a manual trigger, bypassing the scheduler clock
    pub async fn trigger_run(
        &self,
        graph_name: &str,
        params: serde_json::Value,
    ) -> EngineResult<RunInstance> {
        let graph = self
            .registry
            .get(graph_name)
            .ok_or_else(|| EngineError::GraphNotDeployed(graph_name.to_string()))?;

        self.create_run(&graph, RunKind::Manual { params }).await
    }

    /// Create runs for every interval of `graph_name` that is due at `now`
    pub async fn schedule_due(
        &self,
        graph_name: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<RunInstance>> {
        let graph = self
            .registry
            .get(graph_name)
            .ok_or_else(|| EngineError::GraphNotDeployed(graph_name.to_string()))?;

        let due = self.clock.due_intervals(graph.definition(), now)?;

        let mut runs = Vec::with_capacity(due.instantiate.len());
        for interval in due.instantiate.iter().copied() {
            let run = self
                .create_run(&graph, RunKind::Scheduled { interval })
                .await?;
            self.clock.mark_instantiated(graph.name(), &interval)?;
            runs.push(run);
        }

        // Skipped intervals count as handled
        if let Some(newest) = due.newest() {
            self.clock.mark_instantiated(graph.name(), &newest)?;
        }

        Ok(runs)
    }

    async fn create_run(&self, graph: &TaskGraph, kind: RunKind) -> EngineResult<RunInstance> {
        let run = RunInstance::new(graph, kind);

        tracing::info!(
            "Created run {} for graph {} v{}",
            run.id,
            graph.name(),
            graph.version()
        );

        self.record(
            &run,
            EventType::RunCreated {
                graph_name: run.graph_name.clone(),
                graph_version: run.graph_version,
                interval: run.logical_interval(),
            },
        )
        .await?;

        Ok(run)
    }

    /// Dispatch every task whose trigger rule is satisfied.
    ///
    /// Returns the tasks dispatched by this call only. Calling it again without
    /// an intervening report dispatches nothing new.
    pub async fn advance(&self, run: &mut RunInstance) -> EngineResult<BTreeSet<TaskId>> {
        self.advance_at(run, Utc::now()).await
    }

    /// [`ExecutionEngine::advance`] with an explicit notion of "now" for retry timing
    pub async fn advance_at(
        &self,
        run: &mut RunInstance,
        now: DateTime<Utc>,
    ) -> EngineResult<BTreeSet<TaskId>> {
        if run.state.is_terminal() {
            return Ok(BTreeSet::new());
        }

        let result = match self.graph_for(run) {
            Ok(graph) => self.advance_graph(run, &graph, now).await,
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.is_internal() => Err(self.fail_run(run, e).await),
            other => other,
        }
    }

    async fn advance_graph(
        &self,
        run: &mut RunInstance,
        graph: &TaskGraph,
        now: DateTime<Utc>,
    ) -> EngineResult<BTreeSet<TaskId>> {
        let mut dispatched = BTreeSet::new();

        // Upstream tasks come first, so failures propagate transitively in one pass
        for task_id in graph.topological_order() {
            let (state, retry_at) = run
                .task(&task_id)
                .map(|t| (t.state, t.retry_at))
                .ok_or_else(|| EngineError::UnknownTask {
                    run_id: run.id,
                    task: task_id.clone(),
                })?;

            match state {
                TaskState::Pending => match trigger::decide(graph, &task_id, run) {
                    TriggerDecision::Runnable => {
                        self.dispatch(run, graph, &task_id, now).await?;
                        dispatched.insert(task_id);
                    }
                    TriggerDecision::UpstreamFailed => {
                        run.transition(&task_id, TaskState::UpstreamFailed, now)?;
                        tracing::info!(
                            "Task {} in run {} marked upstream_failed",
                            task_id,
                            run.id
                        );
                        self.record(run, EventType::TaskUpstreamFailed { task_id })
                            .await?;
                    }
                    TriggerDecision::Skip => {
                        run.transition(&task_id, TaskState::Skipped, now)?;
                        tracing::info!("Task {} in run {} skipped by trigger rule", task_id, run.id);
                        self.record(
                            run,
                            EventType::TaskSkipped {
                                task_id,
                                reason: "trigger rule not satisfiable".to_string(),
                            },
                        )
                        .await?;
                    }
                    TriggerDecision::Wait => {}
                },
                TaskState::Retrying if retry_at.map_or(true, |at| at <= now) => {
                    self.dispatch(run, graph, &task_id, now).await?;
                    dispatched.insert(task_id);
                }
                _ => {}
            }
        }

        self.finalize_if_done(run, graph).await?;

        Ok(dispatched)
    }

    /// Move a task to queued, then running, and hand it to the operator runner
    async fn dispatch(
        &self,
        run: &mut RunInstance,
        graph: &TaskGraph,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let definition = graph
            .task(task_id)
            .ok_or_else(|| EngineError::UnknownTask {
                run_id: run.id,
                task: task_id.clone(),
            })?
            .clone();

        run.transition(task_id, TaskState::Queued, now)?;
        let attempt = run.task(task_id).map(|t| t.attempt).unwrap_or(1);
        self.record(
            run,
            EventType::TaskQueued {
                task_id: task_id.clone(),
                attempt,
            },
        )
        .await?;

        run.transition(task_id, TaskState::Running, now)?;
        self.record(
            run,
            EventType::TaskStarted {
                task_id: task_id.clone(),
                attempt,
            },
        )
        .await?;

        tracing::info!(
            "Dispatching task {} (attempt {}) for run {}",
            task_id,
            attempt,
            run.id
        );

        let cancelled = self.cancel_receiver(run.id);
        let run_params = match &run.kind {
            RunKind::Manual { params } => params.clone(),
            RunKind::Scheduled { .. } => serde_json::Value::Null,
        };
        let ctx = TaskContext::new(
            run.id,
            run.graph_name.clone(),
            task_id.clone(),
            attempt,
            run.logical_interval(),
            run_params,
            cancelled.clone(),
        );

        let runner = self.runner.clone();
        let reports = self.reports.clone();
        let timeout_secs = definition.timeout_secs.or(self.config.default_timeout_secs);
        let report_base = (run.id, task_id.clone(), attempt);

        tokio::spawn(async move {
            let invocation = invoke_with_timeout(runner, definition.operator, ctx, timeout_secs);

            let outcome = tokio::select! {
                outcome = invocation => Some(outcome),
                _ = wait_cancelled(cancelled) => None,
            };

            let (run_id, task_id, attempt) = report_base;
            match outcome {
                Some(outcome) => {
                    let report = TaskReport {
                        run_id,
                        task_id,
                        attempt,
                        outcome,
                    };
                    if reports.send(report).is_err() {
                        tracing::warn!("Report receiver dropped, result of run {} lost", run_id);
                    }
                }
                None => {
                    tracing::info!(
                        "Invocation of task {} in run {} stopped by cancellation",
                        task_id,
                        run_id
                    );
                }
            }
        });

        Ok(())
    }

    /// Apply an operator outcome to a running task.
    ///
    /// Stale reports (wrong attempt, task no longer running, finished run) are
    /// ignored. Callers re-invoke [`ExecutionEngine::advance`] afterwards.
    pub async fn report_result(
        &self,
        run: &mut RunInstance,
        task_id: &TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    ) -> EngineResult<()> {
        if run.state.is_terminal() {
            tracing::debug!(
                "Ignoring result of task {} for finished run {}",
                task_id,
                run.id
            );
            return Ok(());
        }

        let result = match self.graph_for(run) {
            Ok(graph) => {
                self.apply_outcome(run, &graph, task_id, attempt, outcome, Utc::now())
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.is_internal() => Err(self.fail_run(run, e).await),
            other => other,
        }
    }

    /// Apply a report produced by a dispatched invocation
    pub async fn apply_report(&self, run: &mut RunInstance, report: TaskReport) -> EngineResult<()> {
        if report.run_id != run.id {
            tracing::debug!(
                "Report for run {} does not belong to run {}",
                report.run_id,
                run.id
            );
            return Ok(());
        }
        self.report_result(run, &report.task_id, report.attempt, report.outcome)
            .await
    }

    async fn apply_outcome(
        &self,
        run: &mut RunInstance,
        graph: &TaskGraph,
        task_id: &TaskId,
        attempt: u32,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let instance = run.task(task_id).ok_or_else(|| EngineError::UnknownTask {
            run_id: run.id,
            task: task_id.clone(),
        })?;

        if instance.state != TaskState::Running || instance.attempt != attempt {
            tracing::debug!(
                "Ignoring stale result of task {} attempt {} in run {} (state {}, attempt {})",
                task_id,
                attempt,
                run.id,
                instance.state,
                instance.attempt
            );
            return Ok(());
        }

        match outcome {
            TaskOutcome::Success => {
                run.transition(task_id, TaskState::Success, now)?;
                run.set_task_error(task_id, None)?;
                tracing::info!("Task {} in run {} succeeded", task_id, run.id);
                self.record(
                    run,
                    EventType::TaskSucceeded {
                        task_id: task_id.clone(),
                        attempt,
                    },
                )
                .await?;
            }
            TaskOutcome::Failure(error) => {
                let policy = graph.retry_policy(task_id, &self.config.default_retry);
                let will_retry = policy.should_retry(attempt);

                run.set_task_error(task_id, Some(error.to_string()))?;
                if will_retry {
                    let backoff = policy.backoff_for(attempt);
                    run.transition(task_id, TaskState::Retrying, now)?;
                    let retry_at = now
                        .checked_add_signed(backoff)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    run.set_retry_at(task_id, retry_at)?;
                    tracing::warn!(
                        "Task {} in run {} failed (attempt {}), retrying in {}s: {}",
                        task_id,
                        run.id,
                        attempt,
                        backoff.num_seconds(),
                        error
                    );
                } else {
                    run.transition(task_id, TaskState::Failed, now)?;
                    tracing::warn!(
                        "Task {} in run {} failed after {} attempt(s): {}",
                        task_id,
                        run.id,
                        attempt,
                        error
                    );
                }

                self.record(
                    run,
                    EventType::TaskFailed {
                        task_id: task_id.clone(),
                        attempt,
                        error: error.to_string(),
                        will_retry,
                    },
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Cancel a run: every non-terminal task becomes skipped and in-flight
    /// invocations are told to stop. Returns the tasks that were skipped.
    pub async fn cancel(&self, run: &mut RunInstance) -> EngineResult<Vec<TaskId>> {
        if run.state.is_terminal() {
            return Ok(Vec::new());
        }

        self.signal_cancel(run.id);

        let now = Utc::now();
        let open: Vec<TaskId> = run
            .tasks
            .iter()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in &open {
            run.transition(task_id, TaskState::Skipped, now)?;
            self.record(
                run,
                EventType::TaskSkipped {
                    task_id: task_id.clone(),
                    reason: "run cancelled".to_string(),
                },
            )
            .await?;
        }

        run.finish(RunState::Cancelled, None);
        self.record(run, EventType::RunCancelled).await?;
        tracing::info!("Cancelled run {} ({} tasks skipped)", run.id, open.len());

        Ok(open)
    }

    /// Earliest time a retrying task becomes due, if any
    pub fn next_wakeup(&self, run: &RunInstance) -> Option<DateTime<Utc>> {
        if run.state.is_terminal() {
            return None;
        }
        run.tasks
            .iter()
            .filter(|t| t.state == TaskState::Retrying)
            .filter_map(|t| t.retry_at)
            .min()
    }

    /// Load runs left active by a previous process.
    ///
    /// Their in-flight invocations are gone, so queued and running tasks are
    /// treated as failed attempts and follow the ordinary retry rules.
    pub async fn recover(&self) -> EngineResult<Vec<RunInstance>> {
        let mut runs = self.store.list_active_runs().map_err(EngineError::Storage)?;
        let now = Utc::now();

        for run in runs.iter_mut() {
            let interrupted: Vec<(TaskId, TaskState, u32)> = run
                .tasks
                .iter()
                .filter(|t| t.state.is_in_flight())
                .map(|t| (t.task_id.clone(), t.state, t.attempt))
                .collect();

            for (task_id, state, attempt) in interrupted {
                if state == TaskState::Queued {
                    run.transition(&task_id, TaskState::Running, now)?;
                }
                tracing::warn!(
                    "Task {} in run {} was interrupted by a restart",
                    task_id,
                    run.id
                );
                self.report_result(
                    run,
                    &task_id,
                    attempt,
                    TaskOutcome::failure("interrupted by engine restart"),
                )
                .await?;
            }
        }

        tracing::info!("Recovered {} active run(s)", runs.len());
        Ok(runs)
    }

    async fn finalize_if_done(&self, run: &mut RunInstance, graph: &TaskGraph) -> EngineResult<()> {
        if !run.all_tasks_terminal() {
            return Ok(());
        }

        // Leaves decide: a trigger rule that runs after a failure rescues the run
        let failed_leaves: Vec<String> = graph
            .leaves()
            .into_iter()
            .filter(|t| run.state_of(t).is_some_and(|s| s.is_failure()))
            .map(|t| t.0)
            .collect();

        let (state, error) = if failed_leaves.is_empty() {
            (RunState::Success, None)
        } else {
            (
                RunState::Failed,
                Some(format!("Failed tasks: {}", failed_leaves.join(", "))),
            )
        };

        run.finish(state, error.clone());
        self.drop_cancel_signal(run.id);
        self.record(run, EventType::RunFinished { state, error })
            .await?;

        match state {
            RunState::Success => tracing::info!("Run {} succeeded", run.id),
            _ => tracing::warn!("Run {} failed", run.id),
        }

        Ok(())
    }

    /// Mark a run failed after an internal error; other runs are unaffected
    async fn fail_run(&self, run: &mut RunInstance, error: EngineError) -> EngineError {
        tracing::error!("Engine error in run {}, failing run: {}", run.id, error);

        self.signal_cancel(run.id);
        run.finish(RunState::Failed, Some(error.to_string()));

        let finished = EventType::RunFinished {
            state: RunState::Failed,
            error: Some(error.to_string()),
        };
        if let Err(e) = self.record(run, finished).await {
            tracing::error!("Failed to persist failed run {}: {}", run.id, e);
        }

        error
    }

    fn graph_for(&self, run: &RunInstance) -> EngineResult<Arc<TaskGraph>> {
        self.registry
            .get_version(&run.graph_name, run.graph_version)
            .ok_or_else(|| EngineError::UnknownGraph {
                name: run.graph_name.clone(),
                version: run.graph_version,
            })
    }

    /// Persist the run, then log the event
    async fn record(&self, run: &RunInstance, event_type: EventType) -> EngineResult<()> {
        self.store.save_run(run).map_err(EngineError::Storage)?;
        self.event_log
            .append(Event::new(run.id, event_type))
            .await
            .map_err(EngineError::Storage)
    }

    fn cancel_receiver(&self, run_id: RunId) -> watch::Receiver<bool> {
        let mut signals = self.cancel_signals.lock().unwrap_or_else(|e| e.into_inner());
        signals
            .entry(run_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn signal_cancel(&self, run_id: RunId) {
        let mut signals = self.cancel_signals.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(signal) = signals.remove(&run_id) {
            signal.send_replace(true);
        }
    }

    fn drop_cancel_signal(&self, run_id: RunId) {
        let mut signals = self.cancel_signals.lock().unwrap_or_else(|e| e.into_inner());
        signals.remove(&run_id);
    }
}

async fn invoke_with_timeout(
    runner: Arc<dyn OperatorRunner>,
    operator: crate::types::OperatorRef,
    ctx: TaskContext,
    timeout_secs: Option<u64>,
) -> TaskOutcome {
    let invocation = runner.invoke(&operator, ctx);

    match timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), invocation).await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Failure(TaskExecutionError::Timeout { secs }),
        },
        None => invocation.await,
    }
}

async fn wait_cancelled(mut cancelled: watch::Receiver<bool>) {
    while !*cancelled.borrow_and_update() {
        if cancelled.changed().await.is_err() {
            // Signal dropped without cancelling: let the invocation finish
            std::future::pending::<()>().await;
        }
    }
}

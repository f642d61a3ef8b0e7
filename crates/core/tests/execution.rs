use chrono::{DateTime, TimeZone, Utc};
use dagflow_core::config::{EngineConfig, SchedulerConfig};
use dagflow_core::error::{EngineError, GraphError};
use dagflow_core::events::{EventLog, EventType};
use dagflow_core::operator::{OperatorRunner, TaskContext, TaskOutcome};
use dagflow_core::storage::{JsonlEventLog, MemoryEventLog, MemoryRunStore, RedbRunStore, RunStore};
use dagflow_core::workflow::{run_to_completion, ExecutionEngine, GraphRegistry, ReportReceiver};
use dagflow_core::{
    GraphDefinition, OperatorRef, RunKind, RunState, TaskDefinition, TaskId, TaskState,
    TriggerRule,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted outcomes per task; `block` operators never finish on their own
#[derive(Default)]
struct TestRunner {
    outcomes: Mutex<HashMap<String, VecDeque<TaskOutcome>>>,
    invocations: Mutex<Vec<(String, u32)>>,
}

impl TestRunner {
    fn failing(task: &str, times: usize) -> Self {
        let runner = Self::default();
        runner.outcomes.lock().unwrap().insert(
            task.to_string(),
            (0..times).map(|_| TaskOutcome::failure("exit code 1")).collect(),
        );
        runner
    }
}

#[async_trait::async_trait]
impl OperatorRunner for TestRunner {
    async fn invoke(&self, operator: &OperatorRef, mut ctx: TaskContext) -> TaskOutcome {
        self.invocations
            .lock()
            .unwrap()
            .push((ctx.task_id.to_string(), ctx.attempt));

        if operator.kind == "block" {
            ctx.cancelled().await;
            std::future::pending::<()>().await;
        }

        self.outcomes
            .lock()
            .unwrap()
            .get_mut(ctx.task_id.as_str())
            .and_then(|q| q.pop_front())
            .unwrap_or(TaskOutcome::Success)
    }
}

fn dag_a(dummy_kind: &str) -> GraphDefinition {
    let start = Utc.with_ymd_and_hms(2022, 5, 23, 0, 0, 0).unwrap();
    GraphDefinition::new("DAG-A", start)
        .with_catchup(false)
        .task(TaskDefinition::new("dummy_task", OperatorRef::new(dummy_kind)))
        .task(TaskDefinition::new("bash_task", OperatorRef::new("bash")))
        .edge("dummy_task", "bash_task")
}

fn engine_with(
    definition: GraphDefinition,
    runner: Arc<TestRunner>,
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventLog>,
) -> (ExecutionEngine, ReportReceiver) {
    let registry = Arc::new(GraphRegistry::new());
    registry.deploy(definition).unwrap();
    ExecutionEngine::new(
        registry,
        runner,
        store,
        events,
        EngineConfig::default(),
        SchedulerConfig::default(),
    )
}

fn engine(definition: GraphDefinition, runner: Arc<TestRunner>) -> (ExecutionEngine, ReportReceiver) {
    engine_with(
        definition,
        runner,
        Arc::new(MemoryRunStore::new()),
        Arc::new(MemoryEventLog::new()),
    )
}

fn ids(names: &[&str]) -> BTreeSet<TaskId> {
    names.iter().map(|n| TaskId::new(*n)).collect()
}

#[tokio::test]
async fn dag_a_success_dispatches_bash_task_after_dummy_task() {
    let runner = Arc::new(TestRunner::default());
    let (engine, mut reports) = engine(dag_a("dummy"), runner.clone());
    let mut run = engine.trigger_run("DAG-A", serde_json::Value::Null).await.unwrap();

    assert_eq!(engine.advance(&mut run).await.unwrap(), ids(&["dummy_task"]));
    assert_eq!(run.state_of(&TaskId::new("bash_task")), Some(TaskState::Pending));

    let report = reports.recv().await.unwrap();
    assert_eq!(report.task_id, TaskId::new("dummy_task"));
    engine.apply_report(&mut run, report).await.unwrap();

    assert_eq!(engine.advance(&mut run).await.unwrap(), ids(&["bash_task"]));

    let report = reports.recv().await.unwrap();
    engine.apply_report(&mut run, report).await.unwrap();
    assert!(engine.advance(&mut run).await.unwrap().is_empty());

    assert_eq!(run.state, RunState::Success);
    assert!(run.completed_at.is_some());
    assert_eq!(
        *runner.invocations.lock().unwrap(),
        vec![("dummy_task".to_string(), 1), ("bash_task".to_string(), 1)]
    );
}

#[tokio::test]
async fn dag_a_exhausted_failure_marks_bash_task_upstream_failed() {
    let runner = Arc::new(TestRunner::failing("dummy_task", 1));
    let (engine, mut reports) = engine(dag_a("dummy"), runner.clone());
    let mut run = engine.trigger_run("DAG-A", serde_json::Value::Null).await.unwrap();

    run_to_completion(&engine, &mut reports, &mut run).await.unwrap();

    assert_eq!(run.state_of(&TaskId::new("dummy_task")), Some(TaskState::Failed));
    assert_eq!(
        run.state_of(&TaskId::new("bash_task")),
        Some(TaskState::UpstreamFailed)
    );
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(runner.invocations.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn upstream_failure_propagates_through_chain_and_all_done_leaf_rescues_run() {
    let start = Utc.with_ymd_and_hms(2022, 5, 23, 0, 0, 0).unwrap();
    let definition = GraphDefinition::new("chain", start)
        .task(TaskDefinition::new("a", OperatorRef::new("dummy")))
        .task(TaskDefinition::new("b", OperatorRef::new("dummy")))
        .task(TaskDefinition::new("c", OperatorRef::new("dummy")))
        .task(
            TaskDefinition::new("cleanup", OperatorRef::new("dummy"))
                .with_trigger_rule(TriggerRule::AllDone),
        )
        .edge("a", "b")
        .edge("b", "c")
        .edge("c", "cleanup");

    let runner = Arc::new(TestRunner::failing("a", 1));
    let (engine, mut reports) = engine(definition, runner.clone());
    let mut run = engine.trigger_run("chain", serde_json::Value::Null).await.unwrap();

    run_to_completion(&engine, &mut reports, &mut run).await.unwrap();

    assert_eq!(run.state_of(&TaskId::new("a")), Some(TaskState::Failed));
    assert_eq!(run.state_of(&TaskId::new("b")), Some(TaskState::UpstreamFailed));
    assert_eq!(run.state_of(&TaskId::new("c")), Some(TaskState::UpstreamFailed));
    assert_eq!(run.state_of(&TaskId::new("cleanup")), Some(TaskState::Success));
    assert_eq!(run.state, RunState::Success);
    assert!(run.error.is_none());
    assert_eq!(
        *runner.invocations.lock().unwrap(),
        vec![("a".to_string(), 1), ("cleanup".to_string(), 1)]
    );
}

#[tokio::test]
async fn second_advance_without_report_dispatches_nothing() {
    let (engine, _reports) = engine(dag_a("block"), Arc::new(TestRunner::default()));
    let mut run = engine.trigger_run("DAG-A", serde_json::Value::Null).await.unwrap();

    let first = engine.advance(&mut run).await.unwrap();
    let in_flight = run.tasks_in(TaskState::Running);

    let second = engine.advance(&mut run).await.unwrap();
    assert_eq!(first, ids(&["dummy_task"]));
    assert!(second.is_empty());
    assert_eq!(run.tasks_in(TaskState::Running), in_flight);
    assert_eq!(run.task(&TaskId::new("dummy_task")).unwrap().attempt, 1);
}

#[tokio::test]
async fn cancel_skips_pending_tasks_and_stops_invocations() {
    let (engine, mut reports) = engine(dag_a("block"), Arc::new(TestRunner::default()));
    let mut run = engine.trigger_run("DAG-A", serde_json::Value::Null).await.unwrap();
    engine.advance(&mut run).await.unwrap();

    let skipped = engine.cancel(&mut run).await.unwrap();

    assert_eq!(skipped.len(), 2);
    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.state_of(&TaskId::new("bash_task")), Some(TaskState::Skipped));
    assert_eq!(run.state_of(&TaskId::new("dummy_task")), Some(TaskState::Skipped));

    // The blocked invocation is dropped without reporting
    let report = tokio::time::timeout(Duration::from_millis(200), reports.recv()).await;
    assert!(report.is_err());

    assert!(engine.advance(&mut run).await.unwrap().is_empty());
    assert!(engine.cancel(&mut run).await.unwrap().is_empty());
}

#[tokio::test]
async fn cyclic_definition_never_produces_runs() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let cyclic = GraphDefinition::new("loop", start)
        .task(TaskDefinition::new("a", OperatorRef::new("dummy")))
        .task(TaskDefinition::new("b", OperatorRef::new("dummy")))
        .edge("a", "b")
        .edge("b", "a");

    let store = Arc::new(MemoryRunStore::new());
    let registry = Arc::new(GraphRegistry::new());
    let err = registry.deploy(cyclic).unwrap_err();
    assert!(matches!(err, GraphError::CycleDetected { ref graph, .. } if graph == "loop"));

    let (engine, _reports) = ExecutionEngine::new(
        registry,
        Arc::new(TestRunner::default()),
        store.clone(),
        Arc::new(MemoryEventLog::new()),
        EngineConfig::default(),
        SchedulerConfig::default(),
    );

    let err = engine
        .trigger_run("loop", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::GraphNotDeployed(_)));
    assert!(store.list_runs().unwrap().is_empty());
}

fn hourly(catchup: bool) -> GraphDefinition {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    GraphDefinition::new("hourly", start)
        .with_schedule("@hourly")
        .with_catchup(catchup)
        .task(TaskDefinition::new("extract", OperatorRef::new("dummy")))
}

fn three_hours_later() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap()
}

fn interval_start(kind: &RunKind) -> DateTime<Utc> {
    match kind {
        RunKind::Scheduled { interval } => interval.start,
        RunKind::Manual { .. } => panic!("expected a scheduled run"),
    }
}

#[tokio::test]
async fn missed_intervals_without_catchup_create_only_latest_run() {
    let (engine, _reports) = engine(hourly(false), Arc::new(TestRunner::default()));

    let runs = engine.schedule_due("hourly", three_hours_later()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        interval_start(&runs[0].kind),
        Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap()
    );

    // Skipped intervals are never instantiated later
    let again = engine.schedule_due("hourly", three_hours_later()).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn missed_intervals_with_catchup_run_in_order() {
    let (engine, _reports) = engine(hourly(true), Arc::new(TestRunner::default()));

    let runs = engine.schedule_due("hourly", three_hours_later()).await.unwrap();
    let starts: Vec<u32> = runs
        .iter()
        .map(|r| chrono::Timelike::hour(&interval_start(&r.kind)))
        .collect();
    assert_eq!(starts, vec![0, 1, 2]);

    let next_hour = Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap();
    let runs = engine.schedule_due("hourly", next_hour).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(chrono::Timelike::hour(&interval_start(&runs[0].kind)), 3);
}

#[tokio::test]
async fn persisted_run_and_events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("runs.redb");
    let events_dir = dir.path().join("events");

    let run_id = {
        let store = Arc::new(RedbRunStore::new(db_path.clone()).unwrap());
        let events = Arc::new(JsonlEventLog::new(events_dir.clone()).unwrap());
        let (engine, mut reports) =
            engine_with(dag_a("dummy"), Arc::new(TestRunner::default()), store, events);

        let mut run = engine.trigger_run("DAG-A", serde_json::json!({"conf": 1})).await.unwrap();
        run_to_completion(&engine, &mut reports, &mut run).await.unwrap();
        assert_eq!(run.state, RunState::Success);
        run.id
    };

    let store = RedbRunStore::new(db_path).unwrap();
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Success);
    assert_eq!(run.state_of(&TaskId::new("bash_task")), Some(TaskState::Success));

    let events = JsonlEventLog::new(events_dir).unwrap();
    let events = events.get_run_events(run_id).await.unwrap();
    assert!(matches!(events.first().map(|e| &e.event_type), Some(EventType::RunCreated { .. })));
    assert!(matches!(
        events.last().map(|e| &e.event_type),
        Some(EventType::RunFinished { state: RunState::Success, .. })
    ));
}

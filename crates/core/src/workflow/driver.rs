use super::executor::{ExecutionEngine, ReportReceiver, TaskReport};
use super::run::RunInstance;
use crate::error::{EngineError, EngineResult};
use crate::types::RunId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Drive a single run until it reaches a terminal state.
///
/// Reports belonging to other runs are dropped, so the receiver should not be
/// shared with another driver.
pub async fn run_to_completion(
    engine: &ExecutionEngine,
    reports: &mut ReportReceiver,
    run: &mut RunInstance,
) -> EngineResult<()> {
    loop {
        engine.advance(run).await?;
        if run.state.is_terminal() {
            return Ok(());
        }

        let wakeup = engine.next_wakeup(run);
        tokio::select! {
            report = reports.recv() => match report {
                Some(report) => engine.apply_report(run, report).await?,
                None => {
                    tracing::warn!("Report channel closed while run {} was active", run.id);
                    return Ok(());
                }
            },
            _ = sleep_until(wakeup) => {}
        }
    }
}

async fn sleep_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending::<()>().await,
    }
}

enum Command {
    Trigger {
        graph_name: String,
        params: serde_json::Value,
        reply: oneshot::Sender<EngineResult<RunInstance>>,
    },
    Cancel {
        run_id: RunId,
        reply: oneshot::Sender<EngineResult<Option<RunInstance>>>,
    },
    GetRun {
        run_id: RunId,
        reply: oneshot::Sender<EngineResult<Option<RunInstance>>>,
    },
    ActiveRuns {
        reply: oneshot::Sender<Vec<RunInstance>>,
    },
    Tick {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Cloneable handle for talking to a [`RunDriver`]
#[derive(Clone)]
pub struct DriverHandle {
    commands: mpsc::Sender<Command>,
}

impl DriverHandle {
    /// Create a manual run; it is started as soon as the graph has capacity
    pub async fn trigger(
        &self,
        graph_name: impl Into<String>,
        params: serde_json::Value,
    ) -> EngineResult<RunInstance> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Trigger {
            graph_name: graph_name.into(),
            params,
            reply,
        })
        .await?;
        rx.await.map_err(driver_gone)?
    }

    /// Cancel a run; `None` if the driver does not own it
    pub async fn cancel(&self, run_id: RunId) -> EngineResult<Option<RunInstance>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { run_id, reply }).await?;
        rx.await.map_err(driver_gone)?
    }

    /// Current state of a run, active or stored
    pub async fn get_run(&self, run_id: RunId) -> EngineResult<Option<RunInstance>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetRun { run_id, reply }).await?;
        rx.await.map_err(driver_gone)?
    }

    /// Runs that are executing or waiting for capacity
    pub async fn active_runs(&self) -> EngineResult<Vec<RunInstance>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ActiveRuns { reply }).await?;
        rx.await.map_err(driver_gone)
    }

    /// Evaluate the scheduler clock now; returns the number of runs created
    pub async fn tick(&self) -> EngineResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Tick { reply }).await?;
        rx.await.map_err(driver_gone)
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> EngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::DriverStopped)
    }
}

fn driver_gone(_: oneshot::error::RecvError) -> EngineError {
    EngineError::DriverStopped
}

/// Control loop owning every active run.
///
/// Routes operator reports to their run, re-invokes `advance`, evaluates the
/// scheduler clock on every tick and holds back runs beyond a graph's
/// `max_active_runs`.
pub struct RunDriver {
    engine: Arc<ExecutionEngine>,
    reports: ReportReceiver,
    commands: mpsc::Receiver<Command>,
    active: HashMap<RunId, RunInstance>,
    waiting: VecDeque<RunInstance>,
    tick_every: Option<Duration>,
}

impl RunDriver {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        reports: ReportReceiver,
        tick_every: Option<Duration>,
    ) -> (Self, DriverHandle) {
        let (tx, rx) = mpsc::channel(64);
        let driver = Self {
            engine,
            reports,
            commands: rx,
            active: HashMap::new(),
            waiting: VecDeque::new(),
            tick_every,
        };
        (driver, DriverHandle { commands: tx })
    }

    /// Adopt runs recovered from storage
    pub fn with_runs(mut self, runs: Vec<RunInstance>) -> Self {
        self.waiting.extend(runs);
        self
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        tracing::info!("Run driver started");

        let mut ticker = self.tick_every.map(|every| {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval
        });

        self.promote_waiting().await;

        loop {
            let wakeup = self
                .active
                .values()
                .filter_map(|run| self.engine.next_wakeup(run))
                .min();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(report) = self.reports.recv() => self.handle_report(report).await,
                _ = next_tick(ticker.as_mut()) => {
                    self.tick().await;
                }
                _ = sleep_until(wakeup) => self.advance_all().await,
            }
        }

        tracing::info!(
            "Run driver stopped with {} active and {} waiting run(s)",
            self.active.len(),
            self.waiting.len()
        );
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Trigger {
                graph_name,
                params,
                reply,
            } => {
                let result = self.engine.trigger_run(&graph_name, params).await;
                let result = match result {
                    Ok(run) => {
                        let snapshot = run.clone();
                        self.waiting.push_back(run);
                        self.promote_waiting().await;
                        Ok(self.snapshot(snapshot))
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Cancel { run_id, reply } => {
                let _ = reply.send(self.cancel(run_id).await);
            }
            Command::GetRun { run_id, reply } => {
                let result = match self.find(run_id) {
                    Some(run) => Ok(Some(run.clone())),
                    None => self
                        .engine
                        .store()
                        .get_run(&run_id)
                        .map_err(EngineError::Storage),
                };
                let _ = reply.send(result);
            }
            Command::ActiveRuns { reply } => {
                let mut runs: Vec<RunInstance> = self
                    .active
                    .values()
                    .chain(self.waiting.iter())
                    .cloned()
                    .collect();
                runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let _ = reply.send(runs);
            }
            Command::Tick { reply } => {
                let created = self.tick().await;
                let _ = reply.send(created);
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_report(&mut self, report: TaskReport) {
        let run_id = report.run_id;
        let Some(run) = self.active.get_mut(&run_id) else {
            tracing::debug!("Dropping report for inactive run {}", run_id);
            return;
        };

        if let Err(e) = self.engine.apply_report(run, report).await {
            tracing::error!("Failed to apply report to run {}: {}", run_id, e);
        }
        self.advance_run(run_id).await;
        self.promote_waiting().await;
    }

    /// Create runs for every due interval of every deployed graph
    async fn tick(&mut self) -> usize {
        let now = Utc::now();
        let mut created = 0;

        for graph in self.engine.registry().list() {
            match self.engine.schedule_due(graph.name(), now).await {
                Ok(runs) => {
                    created += runs.len();
                    self.waiting.extend(runs);
                }
                Err(e) => {
                    tracing::error!("Scheduling graph {} failed: {}", graph.name(), e);
                }
            }
        }

        if created > 0 {
            tracing::info!("Scheduler tick created {} run(s)", created);
        }
        self.promote_waiting().await;
        created
    }

    async fn advance_all(&mut self) {
        let ids: Vec<RunId> = self.active.keys().copied().collect();
        for run_id in ids {
            self.advance_run(run_id).await;
        }
        self.promote_waiting().await;
    }

    async fn advance_run(&mut self, run_id: RunId) {
        let Some(run) = self.active.get_mut(&run_id) else {
            return;
        };

        if let Err(e) = self.engine.advance(run).await {
            tracing::error!("Failed to advance run {}: {}", run_id, e);
        }

        if run.state.is_terminal() {
            self.active.remove(&run_id);
        }
    }

    /// Start waiting runs in creation order while their graph has capacity
    async fn promote_waiting(&mut self) {
        let mut still_waiting = VecDeque::with_capacity(self.waiting.len());

        while let Some(run) = self.waiting.pop_front() {
            if run.state.is_terminal() {
                continue;
            }
            if self.has_capacity(&run) {
                let run_id = run.id;
                self.active.insert(run_id, run);
                self.advance_run(run_id).await;
            } else {
                still_waiting.push_back(run);
            }
        }

        self.waiting = still_waiting;
    }

    fn has_capacity(&self, run: &RunInstance) -> bool {
        let limit = self
            .engine
            .registry()
            .get_version(&run.graph_name, run.graph_version)
            .and_then(|graph| graph.definition().max_active_runs);

        match limit {
            Some(limit) => {
                let active = self
                    .active
                    .values()
                    .filter(|r| r.graph_name == run.graph_name)
                    .count();
                active < limit.max(1)
            }
            None => true,
        }
    }

    async fn cancel(&mut self, run_id: RunId) -> EngineResult<Option<RunInstance>> {
        if let Some(mut run) = self.active.remove(&run_id) {
            self.engine.cancel(&mut run).await?;
            self.promote_waiting().await;
            return Ok(Some(run));
        }

        if let Some(pos) = self.waiting.iter().position(|r| r.id == run_id) {
            if let Some(mut run) = self.waiting.remove(pos) {
                self.engine.cancel(&mut run).await?;
                return Ok(Some(run));
            }
        }

        Ok(None)
    }

    fn find(&self, run_id: RunId) -> Option<&RunInstance> {
        self.active
            .get(&run_id)
            .or_else(|| self.waiting.iter().find(|r| r.id == run_id))
    }

    /// Latest state of a run that was just handed to the driver
    fn snapshot(&self, fallback: RunInstance) -> RunInstance {
        if let Some(run) = self.find(fallback.id) {
            return run.clone();
        }
        // Already finished and dropped from the active set
        match self.engine.store().get_run(&fallback.id) {
            Ok(Some(run)) => run,
            _ => fallback,
        }
    }
}

async fn next_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

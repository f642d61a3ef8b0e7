//! Boundary to external operator implementations.
//!
//! The engine only sees an [`OperatorRef`] and an outcome; what an operator
//! does is up to the runner it is dispatched to.

use crate::error::TaskExecutionError;
use crate::types::{LogicalInterval, OperatorRef, RunId, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Result of one operator invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure(TaskExecutionError),
}

impl TaskOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        TaskOutcome::Failure(TaskExecutionError::OperatorFailed(reason.into()))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

/// Everything an operator gets to know about the invocation
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub graph_name: String,
    pub task_id: TaskId,
    pub attempt: u32,
    pub interval: Option<LogicalInterval>,
    /// Parameters of a manual trigger, `Null` for scheduled runs
    pub run_params: serde_json::Value,
    cancelled: watch::Receiver<bool>,
}

impl TaskContext {
    pub(crate) fn new(
        run_id: RunId,
        graph_name: String,
        task_id: TaskId,
        attempt: u32,
        interval: Option<LogicalInterval>,
        run_params: serde_json::Value,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run_id,
            graph_name,
            task_id,
            attempt,
            interval,
            run_params,
            cancelled,
        }
    }

    /// Whether the run was cancelled while the operator was running
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the run is cancelled
    pub async fn cancelled(&mut self) {
        while !*self.cancelled.borrow_and_update() {
            if self.cancelled.changed().await.is_err() {
                // Signal dropped: the run finished without being cancelled
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Executes operator references on behalf of the engine.
///
/// Called at most once per (run, task, attempt).
#[async_trait::async_trait]
pub trait OperatorRunner: Send + Sync {
    async fn invoke(&self, operator: &OperatorRef, ctx: TaskContext) -> TaskOutcome;
}

/// A single operator kind
#[async_trait::async_trait]
pub trait Operator: Send + Sync {
    async fn execute(&self, params: &serde_json::Value, ctx: &TaskContext) -> anyhow::Result<()>;
}

/// Runner that dispatches on `OperatorRef::kind`
#[derive(Default, Clone)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
    fallback: Option<Arc<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: impl Into<String>, operator: Arc<dyn Operator>) -> Self {
        self.operators.insert(kind.into(), operator);
        self
    }

    /// Operator used for kinds without a registration
    pub fn with_fallback(mut self, operator: Arc<dyn Operator>) -> Self {
        self.fallback = Some(operator);
        self
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.operators.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[async_trait::async_trait]
impl OperatorRunner for OperatorRegistry {
    async fn invoke(&self, operator: &OperatorRef, ctx: TaskContext) -> TaskOutcome {
        let Some(implementation) = self
            .operators
            .get(&operator.kind)
            .or(self.fallback.as_ref())
        else {
            return TaskOutcome::Failure(TaskExecutionError::UnknownOperator(
                operator.kind.clone(),
            ));
        };

        match implementation.execute(&operator.params, &ctx).await {
            Ok(()) => TaskOutcome::Success,
            Err(e) => TaskOutcome::failure(format!("{:#}", e)),
        }
    }
}

/// Does nothing and succeeds
pub struct NoopOperator;

#[async_trait::async_trait]
impl Operator for NoopOperator {
    async fn execute(&self, _params: &serde_json::Value, _ctx: &TaskContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs the invocation instead of performing it
pub struct DryRunOperator;

#[async_trait::async_trait]
impl Operator for DryRunOperator {
    async fn execute(&self, params: &serde_json::Value, ctx: &TaskContext) -> anyhow::Result<()> {
        tracing::info!(
            "Dry run of task {} (attempt {}) in run {}: params={}",
            ctx.task_id,
            ctx.attempt,
            ctx.run_id,
            params
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait::async_trait]
    impl Operator for Failing {
        async fn execute(&self, _params: &serde_json::Value, _ctx: &TaskContext) -> anyhow::Result<()> {
            anyhow::bail!("exit code 1")
        }
    }

    fn ctx() -> TaskContext {
        let (_tx, rx) = watch::channel(false);
        TaskContext::new(
            RunId::new(),
            "DAG-A".to_string(),
            TaskId::new("bash_task"),
            1,
            None,
            serde_json::Value::Null,
            rx,
        )
    }

    #[tokio::test]
    async fn test_registry_dispatches_on_kind() {
        let registry = OperatorRegistry::new()
            .register("dummy", Arc::new(NoopOperator))
            .register("bash", Arc::new(Failing));

        assert_eq!(
            registry.invoke(&OperatorRef::new("dummy"), ctx()).await,
            TaskOutcome::Success
        );
        assert_eq!(
            registry.invoke(&OperatorRef::new("bash"), ctx()).await,
            TaskOutcome::failure("exit code 1")
        );
        assert_eq!(registry.kinds(), vec!["bash".to_string(), "dummy".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_unless_fallback() {
        let registry = OperatorRegistry::new();
        assert_eq!(
            registry.invoke(&OperatorRef::new("sql"), ctx()).await,
            TaskOutcome::Failure(TaskExecutionError::UnknownOperator("sql".to_string()))
        );

        let registry = registry.with_fallback(Arc::new(DryRunOperator));
        assert!(registry.invoke(&OperatorRef::new("sql"), ctx()).await.is_success());
    }

    #[tokio::test]
    async fn test_context_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        let mut ctx = TaskContext::new(
            RunId::new(),
            "DAG-A".to_string(),
            TaskId::new("bash_task"),
            1,
            None,
            serde_json::Value::Null,
            rx,
        );

        assert!(!ctx.is_cancelled());
        tx.send(true).unwrap();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}

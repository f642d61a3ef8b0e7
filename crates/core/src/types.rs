use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Name of a task, unique within its graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// State of a single task within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    UpstreamFailed,
    Skipped,
    Retrying,
}

impl TaskState {
    /// Terminal states are never left again within the same run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::UpstreamFailed | TaskState::Skipped
        )
    }

    /// Failed or failed because of an upstream task
    pub fn is_failure(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::UpstreamFailed)
    }

    /// Queued or running on an operator
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Skipped => "skipped",
            TaskState::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// State of a run instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }
}

/// Which combination of upstream outcomes makes a task runnable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every upstream task succeeded
    #[default]
    AllSuccess,
    /// At least one upstream task succeeded
    #[serde(alias = "any_success")]
    OneSuccess,
    /// Every upstream task finished, whatever the outcome
    AllDone,
    /// Every upstream task failed
    AllFailed,
    /// At least one upstream task failed
    OneFailed,
    /// No upstream task failed (success or skipped)
    NoneFailed,
}

/// Upper bound on any retry backoff (one week)
pub const MAX_BACKOFF_SECS: u64 = 7 * 24 * 3600;

/// Retry policy for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default)]
    pub max_backoff_secs: Option<u64>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_secs() -> u64 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            max_backoff_secs: None,
        }
    }
}

impl RetryPolicy {
    /// Whether a failed `attempt` (1-based) may be followed by another one
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Exponential backoff before the attempt following `attempt`.
    ///
    /// Never exceeds `max_backoff_secs` nor [`MAX_BACKOFF_SECS`].
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let mut secs = self
            .backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(MAX_BACKOFF_SECS);
        if let Some(cap) = self.max_backoff_secs {
            secs = secs.min(cap);
        }
        Duration::seconds(secs as i64)
    }
}

/// Opaque reference to an operator implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRef {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl OperatorRef {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// Declaration of a single task in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: TaskId,
    pub operator: OperatorRef,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub trigger_rule: TriggerRule,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, operator: OperatorRef) -> Self {
        Self {
            name: TaskId::new(name),
            operator,
            retry: None,
            trigger_rule: TriggerRule::default(),
            timeout_secs: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Declarative graph definition as produced by the definition loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `None` or `"none"` means manual triggers only
    #[serde(default)]
    pub schedule_interval: Option<String>,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub catchup: bool,
    #[serde(default)]
    pub max_active_runs: Option<usize>,
    #[serde(default)]
    pub default_retry: Option<RetryPolicy>,
    pub tasks: Vec<TaskDefinition>,
    /// `(upstream, downstream)` pairs
    #[serde(default)]
    pub edges: Vec<(TaskId, TaskId)>,
}

impl GraphDefinition {
    pub fn new(name: impl Into<String>, start_date: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            description: None,
            schedule_interval: None,
            start_date,
            end_date: None,
            catchup: false,
            max_active_runs: None,
            default_retry: None,
            tasks: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule_interval = Some(schedule.into());
        self
    }

    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn edge(mut self, upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        self.edges
            .push((TaskId::new(upstream), TaskId::new(downstream)));
        self
    }

    /// Parse a definition from TOML
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Parse a definition from JSON
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Logical time interval `[start, end)` covered by a scheduled run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl std::fmt::Display for LogicalInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// How a run came into existence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunKind {
    Scheduled { interval: LogicalInterval },
    Manual { params: serde_json::Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_secs: 2,
            max_backoff_secs: Some(10),
        };

        assert_eq!(policy.backoff_for(1), Duration::seconds(2));
        assert_eq!(policy.backoff_for(2), Duration::seconds(4));
        assert_eq!(policy.backoff_for(3), Duration::seconds(8));
        assert_eq!(policy.backoff_for(4), Duration::seconds(10));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn test_uncapped_backoff_is_clamped() {
        let policy = RetryPolicy {
            max_attempts: 40,
            backoff_secs: 86_400,
            max_backoff_secs: None,
        };

        let backoff = policy.backoff_for(33);
        assert_eq!(backoff, Duration::seconds(MAX_BACKOFF_SECS as i64));
        assert!(Utc::now().checked_add_signed(backoff).is_some());

        let policy = RetryPolicy {
            backoff_secs: u64::MAX,
            ..policy
        };
        assert_eq!(policy.backoff_for(1), Duration::seconds(MAX_BACKOFF_SECS as i64));
    }

    #[test]
    fn test_default_policy_never_retries() {
        assert!(!RetryPolicy::default().should_retry(1));
    }

    #[test]
    fn test_definition_from_toml() {
        let content = r#"
            name = "DAG-A"
            start_date = "2022-05-23T00:00:00Z"
            catchup = false
            edges = [["dummy_task", "bash_task"]]

            [[tasks]]
            name = "dummy_task"
            operator = { kind = "dummy" }

            [[tasks]]
            name = "bash_task"
            trigger_rule = "one_success"
            operator = { kind = "bash", params = { bash_command = "echo hi" } }
        "#;

        let definition = GraphDefinition::from_toml(content).unwrap();
        assert_eq!(definition.name, "DAG-A");
        assert!(definition.schedule_interval.is_none());
        assert!(!definition.catchup);
        assert_eq!(definition.tasks.len(), 2);
        assert_eq!(definition.tasks[1].trigger_rule, TriggerRule::OneSuccess);
        assert_eq!(definition.tasks[1].operator.params["bash_command"], "echo hi");
        assert_eq!(
            definition.edges,
            vec![(TaskId::new("dummy_task"), TaskId::new("bash_task"))]
        );
    }
}

use crate::types::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Execution engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Applied to tasks when neither the task nor its graph declares a policy
    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Applied to tasks without their own `timeout_secs`
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            default_timeout_secs: None,
        }
    }
}

/// Scheduler clock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between clock evaluations
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Upper bound on catch-up runs created per graph per tick
    #[serde(default = "default_max_intervals_per_tick")]
    pub max_intervals_per_tick: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_tick_secs() -> u64 {
    30
}

fn default_max_intervals_per_tick() -> usize {
    64
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_secs: default_tick_secs(),
            max_intervals_per_tick: default_max_intervals_per_tick(),
        }
    }
}

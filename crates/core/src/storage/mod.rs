pub mod event_log;
pub mod index;
pub mod memory;

pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use index::RedbRunStore;
pub use memory::MemoryRunStore;

use crate::types::RunId;
use crate::workflow::RunInstance;
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Persistence interface for run instances and scheduler progress
pub trait RunStore: Send + Sync {
    /// Start of the newest interval handled for a graph
    fn load_last_instantiated(&self, graph_name: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record a handled interval; older values than the stored one are ignored
    fn record_instantiated(&self, graph_name: &str, interval_start: DateTime<Utc>) -> Result<()>;

    /// Save a run; called after every task state transition
    fn save_run(&self, run: &RunInstance) -> Result<()>;

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunInstance>>;

    /// All runs, most recent first
    fn list_runs(&self) -> Result<Vec<RunInstance>>;

    /// Runs that have not reached a terminal state (recovery after restart)
    fn list_active_runs(&self) -> Result<Vec<RunInstance>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect())
    }
}

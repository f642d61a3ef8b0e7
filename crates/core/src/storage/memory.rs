use super::RunStore;
use crate::types::RunId;
use crate::workflow::RunInstance;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Non-persistent run store for tests and one-shot CLI runs
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<RunId, RunInstance>>,
    last_instantiated: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn load_last_instantiated(&self, graph_name: &str) -> Result<Option<DateTime<Utc>>> {
        let last = self
            .last_instantiated
            .read()
            .unwrap_or_else(|e| e.into_inner());
        Ok(last.get(graph_name).copied())
    }

    fn record_instantiated(&self, graph_name: &str, interval_start: DateTime<Utc>) -> Result<()> {
        let mut last = self
            .last_instantiated
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let entry = last.entry(graph_name.to_string()).or_insert(interval_start);
        if interval_start > *entry {
            *entry = interval_start;
        }
        Ok(())
    }

    fn save_run(&self, run: &RunInstance) -> Result<()> {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        runs.insert(run.id, run.clone());
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunInstance>> {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        Ok(runs.get(run_id).cloned())
    }

    fn list_runs(&self) -> Result<Vec<RunInstance>> {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        let mut runs: Vec<RunInstance> = runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }
}

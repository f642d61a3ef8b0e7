use super::RunStore;
use crate::types::RunId;
use crate::workflow::RunInstance;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const LAST_INSTANTIATED_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("last_instantiated");

/// Run store backed by redb
#[derive(Clone)]
pub struct RedbRunStore {
    db: Arc<Database>,
}

impl RedbRunStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create run store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
            let _last_table = write_txn
                .open_table(LAST_INSTANTIATED_TABLE)
                .context("Failed to open last instantiated table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl RunStore for RedbRunStore {
    fn load_last_instantiated(&self, graph_name: &str) -> Result<Option<DateTime<Utc>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(LAST_INSTANTIATED_TABLE)
            .context("Failed to open table")?;

        match table.get(graph_name).context("Failed to get interval")? {
            Some(guard) => {
                let start: DateTime<Utc> = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize interval start")?;
                Ok(Some(start))
            }
            None => Ok(None),
        }
    }

    fn record_instantiated(&self, graph_name: &str, interval_start: DateTime<Utc>) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(LAST_INSTANTIATED_TABLE)
                .context("Failed to open table")?;

            // Never move backwards
            let current: Option<DateTime<Utc>> = match table
                .get(graph_name)
                .context("Failed to get interval")?
            {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value())
                        .context("Failed to deserialize interval start")?,
                ),
                None => None,
            };

            if current.map_or(true, |c| interval_start > c) {
                let value =
                    serde_json::to_vec(&interval_start).context("Failed to serialize interval")?;
                table
                    .insert(graph_name, value.as_slice())
                    .context("Failed to record interval")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn save_run(&self, run: &RunInstance) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.id.to_string();
            let value = serde_json::to_vec(run).context("Failed to serialize run")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunInstance>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        match table.get(key.as_str()).context("Failed to get run")? {
            Some(guard) => {
                let run: RunInstance =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    fn list_runs(&self) -> Result<Vec<RunInstance>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: RunInstance =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            runs.push(run);
        }

        // Most recent first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GraphDefinition, OperatorRef, RunKind, RunState, TaskDefinition};
    use crate::workflow::TaskGraph;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_redb_run_store() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = RedbRunStore::new(temp_file.path().to_path_buf()).unwrap();

        let graph = TaskGraph::from_definition(
            GraphDefinition::new("DAG-A", Utc::now())
                .task(TaskDefinition::new("dummy_task", OperatorRef::new("dummy"))),
        )
        .unwrap();
        let mut run = RunInstance::new(
            &graph,
            RunKind::Manual {
                params: serde_json::json!({ "conf": 1 }),
            },
        );

        store.save_run(&run).unwrap();
        assert_eq!(store.get_run(&run.id).unwrap().unwrap(), run);

        run.finish(RunState::Success, None);
        store.save_run(&run).unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Success);
        assert!(store.list_active_runs().unwrap().is_empty());
    }

    #[test]
    fn test_last_instantiated_is_monotonic() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = RedbRunStore::new(temp_file.path().to_path_buf()).unwrap();

        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        assert!(store.load_last_instantiated("hourly").unwrap().is_none());
        store.record_instantiated("hourly", late).unwrap();
        store.record_instantiated("hourly", early).unwrap();
        assert_eq!(store.load_last_instantiated("hourly").unwrap(), Some(late));
    }
}

use anyhow::{Context, Result};
use dagflow_core::config::{EngineConfig, SchedulerConfig};
use dagflow_core::operator::{DryRunOperator, NoopOperator, OperatorRegistry};
use dagflow_core::storage::{JsonlEventLog, RedbRunStore};
use dagflow_core::workflow::{DriverHandle, ExecutionEngine, GraphRegistry, ReportReceiver, RunDriver};
use dagflow_core::GraphDefinition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(skip)]
    pub definitions_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_run_store_file")]
    pub run_store_file: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_run_store_file() -> String {
    "runs.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            run_store_file: default_run_store_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf, definitions_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                definitions_dir: definitions_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
                scheduler: Default::default(),
            }
        };

        config.data_dir = data_dir;
        config.definitions_dir = definitions_dir;

        Ok(config)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the run store file path
    pub fn run_store_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.run_store_file)
    }
}

/// Read every `.toml` and `.json` graph definition in `dir`, sorted by file name
pub fn load_definitions(dir: &Path) -> Result<Vec<(PathBuf, GraphDefinition)>> {
    if !dir.exists() {
        tracing::warn!("Definitions directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read definitions directory {}", dir.display()))?
    {
        let path = entry.context("Failed to read directory entry")?.path();
        if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("toml") | Some("json")
        ) {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let definition = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => GraphDefinition::from_json(&content),
                _ => GraphDefinition::from_toml(&content),
            }
            .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok((path, definition))
        })
        .collect()
}

/// Deploy every definition in the configured directory
pub fn deploy_definitions(config: &ServerConfig) -> Result<Arc<GraphRegistry>> {
    let registry = Arc::new(GraphRegistry::new());

    for (path, definition) in load_definitions(&config.definitions_dir)? {
        registry
            .deploy(definition)
            .with_context(|| format!("Rejected graph definition {}", path.display()))?;
    }

    Ok(registry)
}

/// Operators available to the daemon; unknown kinds are logged instead of executed
pub fn operators() -> OperatorRegistry {
    OperatorRegistry::new()
        .register("dummy", Arc::new(NoopOperator))
        .register("noop", Arc::new(NoopOperator))
        .with_fallback(Arc::new(DryRunOperator))
}

/// Build the execution engine over the configured stores
pub fn build_engine(
    config: &ServerConfig,
    registry: Arc<GraphRegistry>,
) -> Result<(Arc<ExecutionEngine>, ReportReceiver, Arc<JsonlEventLog>)> {
    let event_log = Arc::new(
        JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
    );

    let run_store = Arc::new(
        RedbRunStore::new(config.run_store_path()).context("Failed to create run store")?,
    );

    let (engine, reports) = ExecutionEngine::new(
        registry,
        Arc::new(operators()),
        run_store,
        event_log.clone(),
        config.engine.clone(),
        config.scheduler.clone(),
    );

    Ok((Arc::new(engine), reports, event_log))
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub driver: DriverHandle,
    pub event_log: Arc<JsonlEventLog>,
}

impl AppState {
    /// Load definitions, recover unfinished runs and start the run driver
    pub async fn start(config: &ServerConfig) -> Result<Self> {
        let registry = deploy_definitions(config)?;
        let (engine, reports, event_log) = build_engine(config, registry)?;

        let recovered = engine
            .recover()
            .await
            .context("Failed to recover active runs")?;

        let tick_every = config
            .scheduler
            .enabled
            .then(|| Duration::from_secs(config.scheduler.tick_secs.max(1)));
        if tick_every.is_none() {
            tracing::info!("Scheduler disabled, runs are created by manual triggers only");
        }

        let (driver, handle) = RunDriver::new(engine.clone(), reports, tick_every);
        driver.with_runs(recovered).spawn();

        Ok(Self {
            engine,
            driver: handle,
            event_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("dagflow.toml");
        std::fs::write(
            &config_path,
            r#"
            [engine]
            default_timeout_secs = 600

            [engine.default_retry]
            max_attempts = 3

            [scheduler]
            tick_secs = 5
            "#,
        )
        .unwrap();

        let config =
            ServerConfig::load(&config_path, dir.path().join("data"), dir.path().join("defs"))
                .unwrap();

        assert_eq!(config.engine.default_timeout_secs, Some(600));
        assert_eq!(config.engine.default_retry.max_attempts, 3);
        assert_eq!(config.engine.default_retry.backoff_secs, 1);
        assert_eq!(config.scheduler.tick_secs, 5);
        assert!(config.scheduler.enabled);
        assert_eq!(config.run_store_path(), dir.path().join("data").join("runs.redb"));
    }

    #[test]
    fn test_load_definitions_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dag-a.toml"),
            r#"
            name = "DAG-A"
            start_date = "2022-05-23T00:00:00Z"

            [[tasks]]
            name = "dummy_task"
            operator = { kind = "dummy" }
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a graph").unwrap();

        let definitions = load_definitions(dir.path()).unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].1.name, "DAG-A");
    }
}

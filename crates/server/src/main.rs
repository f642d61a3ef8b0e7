use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dagflow_core::storage::RunStore;
use dagflow_core::workflow::run_to_completion;
use std::path::PathBuf;

mod api;
mod config;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "dagflow")]
#[command(about = "Task dependency graph scheduler and execution engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dagflow.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Directory containing graph definitions
    #[arg(long, default_value = "./definitions")]
    definitions: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and the HTTP API
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Validate graph definitions and print their execution order
    Validate,

    /// Trigger a graph once and wait for the run to finish
    Trigger {
        graph: String,

        /// Run parameters as JSON
        #[arg(long)]
        params: Option<String>,
    },

    /// List stored runs, most recent first
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dagflow=info,dagflow_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    // Load configuration
    let config = ServerConfig::load(&args.config, args.data_dir, args.definitions)?;

    match args.command {
        Command::Serve { port, host } => serve(config, &host, port).await,
        Command::Validate => validate(&config),
        Command::Trigger { graph, params } => trigger(&config, &graph, params.as_deref()).await,
        Command::Runs { limit } => list_runs(&config, limit),
    }
}

async fn serve(config: ServerConfig, host: &str, port: u16) -> Result<()> {
    tracing::info!("Starting Dagflow");
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Definitions: {}", config.definitions_dir.display());

    let state = AppState::start(&config).await?;
    let driver = state.driver.clone();

    let addr = format!("{}:{}", host, port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    })
    .await?;

    driver.shutdown().await?;
    Ok(())
}

fn validate(config: &ServerConfig) -> Result<()> {
    let registry = config::deploy_definitions(config)?;
    let graphs = registry.list();

    if graphs.is_empty() {
        println!("No graph definitions in {}", config.definitions_dir.display());
        return Ok(());
    }

    for graph in graphs {
        let order: Vec<String> = graph
            .topological_order()
            .iter()
            .map(|t| t.to_string())
            .collect();
        println!(
            "{} ({} tasks, schedule {}): {}",
            graph.name(),
            graph.tasks().len(),
            graph
                .definition()
                .schedule_interval
                .as_deref()
                .unwrap_or("none"),
            order.join(" -> ")
        );
    }

    Ok(())
}

async fn trigger(config: &ServerConfig, graph: &str, params: Option<&str>) -> Result<()> {
    let params = match params {
        Some(raw) => serde_json::from_str(raw).context("Invalid --params JSON")?,
        None => serde_json::Value::Null,
    };

    let registry = config::deploy_definitions(config)?;
    let (engine, mut reports, _event_log) = config::build_engine(config, registry)?;

    let mut run = engine.trigger_run(graph, params).await?;
    run_to_completion(&engine, &mut reports, &mut run).await?;

    println!("Run {} finished: {}", run.id, serde_json::to_string(&run.state)?);
    for task in &run.tasks {
        println!(
            "  {:<24} {:<16} attempts={}{}",
            task.task_id.to_string(),
            task.state.to_string(),
            task.attempt,
            task.error
                .as_deref()
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }

    Ok(())
}

fn list_runs(config: &ServerConfig, limit: usize) -> Result<()> {
    let store = dagflow_core::storage::RedbRunStore::new(config.run_store_path())
        .context("Failed to open run store")?;

    for run in store.list_runs()?.into_iter().take(limit) {
        println!(
            "{}  {:<20} v{:<3} {:<10} {}",
            run.id,
            run.graph_name,
            run.graph_version,
            serde_json::to_string(&run.state)?,
            run.created_at.to_rfc3339()
        );
    }

    Ok(())
}

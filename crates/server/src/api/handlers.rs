use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use dagflow_core::{
    events::{Event, EventLog},
    workflow::RunInstance,
    RunId, TaskId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn parse_run_id(run_id: &str) -> ApiResult<RunId> {
    run_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", run_id)))
}

/// List deployed graphs (latest version of each)
pub async fn list_graphs(State(state): State<Arc<AppState>>) -> Json<ListGraphsResponse> {
    let graphs = state
        .engine
        .registry()
        .list()
        .into_iter()
        .map(|graph| {
            let definition = graph.definition();
            GraphSummary {
                name: graph.name().to_string(),
                version: graph.version(),
                description: definition.description.clone(),
                schedule_interval: definition.schedule_interval.clone(),
                catchup: definition.catchup,
                tasks: graph.tasks().iter().map(|t| t.name.clone()).collect(),
            }
        })
        .collect();

    Json(ListGraphsResponse { graphs })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListGraphsResponse {
    pub graphs: Vec<GraphSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphSummary {
    pub name: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_interval: Option<String>,
    pub catchup: bool,
    pub tasks: Vec<TaskId>,
}

/// Topological execution order of a graph
pub async fn get_graph_order(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<GraphOrderResponse>> {
    let graph = state
        .engine
        .registry()
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("Graph '{}' is not deployed", name)))?;

    Ok(Json(GraphOrderResponse {
        graph: name,
        version: graph.version(),
        order: graph.topological_order(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphOrderResponse {
    pub graph: String,
    pub version: u32,
    pub order: Vec<TaskId>,
}

/// Manually trigger a run; the body is optional
pub async fn trigger_run(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Json<RunInstance>> {
    let req: TriggerRunRequest = if body.is_empty() {
        TriggerRunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?
    };

    let run = state.driver.trigger(name, req.params).await?;
    tracing::info!("Manually triggered run {} of graph {}", run.id, run.graph_name);

    Ok(Json(run))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TriggerRunRequest {
    #[serde(default)]
    pub params: serde_json::Value,
}

/// List all runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state.engine.store().list_runs()?;
    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunInstance>,
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunInstance>> {
    let run_id = parse_run_id(&run_id)?;

    let run = state
        .driver
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Run not found"))?;

    Ok(Json(run))
}

/// Get events for a run
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let events = state.event_log.get_run_events(run_id).await?;

    Ok(Json(GetRunEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

/// Cancel an active run
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunInstance>> {
    let run_id = parse_run_id(&run_id)?;

    let run = state
        .driver
        .cancel(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Run not found or already finished"))?;

    Ok(Json(run))
}

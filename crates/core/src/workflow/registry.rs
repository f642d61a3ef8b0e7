use super::dag::TaskGraph;
use crate::error::GraphError;
use crate::types::GraphDefinition;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Deployed graph definitions, keyed by name, with every version retained
/// so runs created from a superseded version can still be driven.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: RwLock<HashMap<String, Vec<Arc<TaskGraph>>>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and deploy a definition as the newest version of its name.
    ///
    /// Rejected definitions are never stored.
    pub fn deploy(&self, definition: GraphDefinition) -> Result<Arc<TaskGraph>, GraphError> {
        let graph = TaskGraph::from_definition(definition)?;

        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        let versions = graphs.entry(graph.name().to_string()).or_default();
        let graph = Arc::new(graph.with_version(versions.len() as u32 + 1));
        versions.push(graph.clone());

        tracing::info!(
            "Deployed graph {} version {} ({} tasks)",
            graph.name(),
            graph.version(),
            graph.tasks().len()
        );

        Ok(graph)
    }

    /// Latest deployed version of a graph
    pub fn get(&self, name: &str) -> Option<Arc<TaskGraph>> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        graphs.get(name).and_then(|versions| versions.last().cloned())
    }

    pub fn get_version(&self, name: &str, version: u32) -> Option<Arc<TaskGraph>> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        graphs
            .get(name)
            .and_then(|versions| versions.get(version.checked_sub(1)? as usize).cloned())
    }

    /// Latest version of every deployed graph, sorted by name
    pub fn list(&self) -> Vec<Arc<TaskGraph>> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        let mut latest: Vec<Arc<TaskGraph>> = graphs
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.name().cmp(b.name()));
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperatorRef, TaskDefinition};
    use chrono::Utc;

    fn definition(name: &str, tasks: &[&str]) -> GraphDefinition {
        tasks.iter().fold(GraphDefinition::new(name, Utc::now()), |def, t| {
            def.task(TaskDefinition::new(*t, OperatorRef::new("noop")))
        })
    }

    #[test]
    fn test_redeploy_creates_new_version() {
        let registry = GraphRegistry::new();

        let v1 = registry.deploy(definition("etl", &["extract"])).unwrap();
        let v2 = registry
            .deploy(definition("etl", &["extract", "load"]))
            .unwrap();

        assert_eq!(v1.version(), 1);
        assert_eq!(v2.version(), 2);
        assert_eq!(registry.get("etl").unwrap().tasks().len(), 2);
        assert_eq!(registry.get_version("etl", 1).unwrap().tasks().len(), 1);
        assert!(registry.get_version("etl", 0).is_none());
        assert!(registry.get_version("etl", 3).is_none());
    }

    #[test]
    fn test_rejected_definition_is_not_stored() {
        let registry = GraphRegistry::new();
        let cyclic = definition("loop", &["a", "b"]).edge("a", "b").edge("b", "a");

        assert!(matches!(
            registry.deploy(cyclic),
            Err(GraphError::CycleDetected { .. })
        ));
        assert!(registry.get("loop").is_none());
        assert!(registry.list().is_empty());
    }
}

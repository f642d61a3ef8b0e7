use crate::error::GraphError;
use crate::types::{GraphDefinition, RetryPolicy, TaskDefinition, TaskId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Validate a graph definition without keeping the built graph
pub fn validate(definition: &GraphDefinition) -> Result<(), GraphError> {
    TaskGraph::from_definition(definition.clone()).map(|_| ())
}

/// Immutable, validated DAG of tasks for one graph definition version.
///
/// Node indices follow declaration order, so index `i` is `definition.tasks[i]`.
#[derive(Debug)]
pub struct TaskGraph {
    definition: GraphDefinition,
    version: u32,
    graph: DiGraph<TaskId, ()>,
    task_indices: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate a DAG from a graph definition
    pub fn from_definition(definition: GraphDefinition) -> Result<Self, GraphError> {
        if definition.name.trim().is_empty() {
            return Err(GraphError::EmptyGraphName);
        }

        let mut graph = DiGraph::new();
        let mut task_indices = HashMap::new();

        // Add all tasks as nodes
        for task in &definition.tasks {
            if task_indices.contains_key(&task.name) {
                return Err(GraphError::DuplicateTask {
                    graph: definition.name.clone(),
                    task: task.name.clone(),
                });
            }
            let node = graph.add_node(task.name.clone());
            task_indices.insert(task.name.clone(), node);
        }

        // Add dependency edges (upstream -> downstream)
        for (upstream, downstream) in &definition.edges {
            let lookup = |task: &TaskId| {
                task_indices
                    .get(task)
                    .copied()
                    .ok_or_else(|| GraphError::DanglingEdge {
                        graph: definition.name.clone(),
                        upstream: upstream.clone(),
                        downstream: downstream.clone(),
                        unknown: task.clone(),
                    })
            };
            let up_idx = lookup(upstream)?;
            let down_idx = lookup(downstream)?;

            graph.update_edge(up_idx, down_idx, ());
        }

        // Verify the graph is acyclic
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::CycleDetected {
                graph: definition.name.clone(),
                task: graph[cycle.node_id()].clone(),
            });
        }

        Ok(Self {
            definition,
            version: 1,
            graph,
            task_indices,
        })
    }

    pub(crate) fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }

    /// Tasks in declaration order
    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.definition.tasks
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskDefinition> {
        self.task_indices
            .get(task_id)
            .map(|node| &self.definition.tasks[node.index()])
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.task_indices.contains_key(task_id)
    }

    /// Retry policy of a task, falling back to the graph default, then `fallback`
    pub fn retry_policy(&self, task_id: &TaskId, fallback: &RetryPolicy) -> RetryPolicy {
        self.task(task_id)
            .and_then(|t| t.retry.clone())
            .or_else(|| self.definition.default_retry.clone())
            .unwrap_or_else(|| fallback.clone())
    }

    /// Tasks in topological order, ties broken by declaration order.
    ///
    /// Diagnostics only: independent branches may run concurrently.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(idx)) = ready.pop() {
            let node = NodeIndex::new(idx);
            order.push(self.graph[node].clone());

            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        order
    }

    /// Direct upstream tasks, in declaration order
    pub fn upstream(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.neighbors(task_id, Direction::Incoming)
    }

    /// Direct downstream tasks, in declaration order
    pub fn downstream(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    /// All tasks reachable downstream of `task_id`
    pub fn descendants(&self, task_id: &TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let Some(&start) = self.task_indices.get(task_id) else {
            return seen;
        };

        let mut dfs = petgraph::visit::Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                seen.insert(self.graph[node].clone());
            }
        }
        seen
    }

    /// Tasks with no upstream (runnable as soon as a run exists)
    pub fn roots(&self) -> Vec<TaskId> {
        self.filter_nodes(Direction::Incoming)
    }

    /// Tasks with no downstream; they decide the final run state
    pub fn leaves(&self) -> Vec<TaskId> {
        self.filter_nodes(Direction::Outgoing)
    }

    fn neighbors(&self, task_id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.task_indices.get(task_id) else {
            return Vec::new();
        };

        let mut indices: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        indices.sort();
        indices.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    fn filter_nodes(&self, direction: Direction) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph.neighbors_directed(n, direction).next().is_none())
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperatorRef;
    use chrono::{TimeZone, Utc};

    fn graph(name: &str, tasks: &[&str], edges: &[(&str, &str)]) -> GraphDefinition {
        let mut definition =
            GraphDefinition::new(name, Utc.with_ymd_and_hms(2022, 5, 23, 0, 0, 0).unwrap());
        for task in tasks {
            definition = definition.task(TaskDefinition::new(*task, OperatorRef::new("noop")));
        }
        for (up, down) in edges {
            definition = definition.edge(*up, *down);
        }
        definition
    }

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::new(*n)).collect()
    }

    #[test]
    fn test_linear_dag() {
        let dag = TaskGraph::from_definition(graph(
            "linear",
            &["step1", "step2", "step3"],
            &[("step1", "step2"), ("step2", "step3")],
        ))
        .unwrap();

        assert_eq!(dag.topological_order(), ids(&["step1", "step2", "step3"]));
        assert_eq!(dag.roots(), ids(&["step1"]));
        assert_eq!(dag.leaves(), ids(&["step3"]));
    }

    #[test]
    fn test_parallel_dag() {
        let dag = TaskGraph::from_definition(graph(
            "parallel",
            &["step1", "step2", "step3", "step4"],
            &[("step1", "step3"), ("step2", "step3"), ("step3", "step4")],
        ))
        .unwrap();

        // step1 and step2 can start in parallel
        assert_eq!(dag.roots(), ids(&["step1", "step2"]));
        assert_eq!(dag.upstream(&TaskId::new("step3")), ids(&["step1", "step2"]));
        assert_eq!(dag.downstream(&TaskId::new("step3")), ids(&["step4"]));

        let below = dag.descendants(&TaskId::new("step1"));
        assert_eq!(below.len(), 2);
        assert!(below.contains(&TaskId::new("step4")));
    }

    #[test]
    fn test_topological_ties_follow_declaration_order() {
        // Declared out of dependency order on purpose
        let dag = TaskGraph::from_definition(graph(
            "ties",
            &["c", "a", "d", "b"],
            &[("a", "b"), ("c", "b"), ("d", "b")],
        ))
        .unwrap();

        assert_eq!(dag.topological_order(), ids(&["c", "a", "d", "b"]));
        assert_eq!(dag.topological_order(), dag.topological_order());
    }

    #[test]
    fn test_cyclic_dag_rejected() {
        let err = TaskGraph::from_definition(graph(
            "cyclic",
            &["step1", "step2"],
            &[("step1", "step2"), ("step2", "step1")],
        ))
        .unwrap_err();

        assert!(matches!(err, GraphError::CycleDetected { .. }));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = validate(&graph("selfish", &["a"], &[("a", "a")]));
        assert!(matches!(result, Err(GraphError::CycleDetected { task, .. }) if task.as_str() == "a"));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let result = validate(&graph("dup", &["a", "b", "a"], &[]));
        assert_eq!(
            result,
            Err(GraphError::DuplicateTask {
                graph: "dup".to_string(),
                task: TaskId::new("a"),
            })
        );
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let result = validate(&graph("dangling", &["a"], &[("a", "ghost")]));
        assert!(matches!(
            result,
            Err(GraphError::DanglingEdge { unknown, .. }) if unknown.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert_eq!(validate(&graph(" ", &["a"], &[])), Err(GraphError::EmptyGraphName));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let dag = TaskGraph::from_definition(graph(
            "twice",
            &["a", "b"],
            &[("a", "b"), ("a", "b")],
        ))
        .unwrap();

        assert_eq!(dag.upstream(&TaskId::new("b")), ids(&["a"]));
        assert_eq!(dag.topological_order(), ids(&["a", "b"]));
    }

    #[test]
    fn test_retry_policy_falls_back_to_graph_default() {
        let mut definition = graph("retries", &["a", "b"], &[]);
        definition.default_retry = Some(RetryPolicy {
            max_attempts: 3,
            backoff_secs: 5,
            max_backoff_secs: None,
        });
        definition.tasks[1].retry = Some(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        let dag = TaskGraph::from_definition(definition).unwrap();

        let fallback = RetryPolicy::default();
        assert_eq!(dag.retry_policy(&TaskId::new("a"), &fallback).max_attempts, 3);
        assert_eq!(dag.retry_policy(&TaskId::new("b"), &fallback).max_attempts, 2);

        let mut bare = graph("bare", &["a"], &[]);
        bare.default_retry = None;
        let dag = TaskGraph::from_definition(bare).unwrap();
        let fallback = RetryPolicy {
            max_attempts: 7,
            ..RetryPolicy::default()
        };
        assert_eq!(dag.retry_policy(&TaskId::new("a"), &fallback).max_attempts, 7);
    }
}

//! Action dependency graph.
//!
//! Dependency edges drive topological ordering and skip/cancel
//! propagation. Recursive-input edges (an action reading the data object
//! it writes) are kept in a separate edge set: they matter for state
//! propagation inside the action but must not participate in ordering or
//! cycle detection.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::ActionId;

/// Directed acyclic graph over action ids.
#[derive(Debug, Clone, Default)]
pub struct ActionDag {
    graph: DiGraph<ActionId, ()>,
    index_map: HashMap<ActionId, NodeIndex>,
    /// Insertion order for deterministic tie-breaking in toposort.
    insertion_order: Vec<NodeIndex>,
    /// Recursive edges, outside the DAG proper.
    recursive_edges: Vec<(ActionId, ActionId)>,
}

impl ActionDag {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Add an action node; adding an existing id is a no-op.
    pub fn add_node(&mut self, id: ActionId) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index_map.insert(id, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Add a dependency edge `from -> to` (to consumes an output of from).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either id is unknown.
    pub fn add_edge(&mut self, from: &ActionId, to: &ActionId) -> Result<()> {
        let from_idx = self.index(from)?;
        let to_idx = self.index(to)?;
        if self
            .graph
            .edges_connecting(from_idx, to_idx)
            .next()
            .is_none()
        {
            self.graph.add_edge(from_idx, to_idx, ());
        }
        Ok(())
    }

    /// Record a recursive edge. Not part of the DAG: excluded from
    /// ordering and cycle detection.
    pub fn add_recursive_edge(&mut self, from: ActionId, to: ActionId) {
        self.recursive_edges.push((from, to));
    }

    /// The recorded recursive edges.
    #[must_use]
    pub fn recursive_edges(&self) -> &[(ActionId, ActionId)] {
        &self.recursive_edges
    }

    fn index(&self, id: &ActionId) -> Result<NodeIndex> {
        self.index_map
            .get(id)
            .copied()
            .ok_or_else(|| OrchestrationError::Config(format!("unknown action '{id}' in graph")))
    }

    /// Topologically sorted action ids.
    ///
    /// Kahn's algorithm with deterministic tie-breaking: nodes of equal
    /// rank are emitted in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming an offending action if the
    /// dependency edges contain a cycle.
    pub fn toposort(&self) -> Result<Vec<ActionId>> {
        let node_count = self.graph.node_count();
        if node_count == 0 {
            return Ok(Vec::new());
        }

        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut result = Vec::with_capacity(node_count);
        while let Some(idx) = queue.pop_front() {
            let id = self
                .graph
                .node_weight(idx)
                .ok_or_else(|| {
                    OrchestrationError::Config(format!("dangling node index {}", idx.index()))
                })?
                .clone();
            result.push(id);

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| {
                self.insertion_order
                    .iter()
                    .position(|&i| i == *n)
                    .unwrap_or(usize::MAX)
            });
            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != node_count {
            let offender = self
                .insertion_order
                .iter()
                .find(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) > 0)
                .and_then(|&idx| self.graph.node_weight(idx))
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            return Err(OrchestrationError::Config(format!(
                "cycle detected in action graph involving '{offender}'"
            )));
        }

        Ok(result)
    }

    /// In-degree (number of upstream dependencies) per action.
    #[must_use]
    pub fn in_degrees(&self) -> HashMap<ActionId, usize> {
        let mut degrees: HashMap<ActionId, usize> = self
            .graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx).map(|id| (id.clone(), 0)))
            .collect();
        for edge in self.graph.edge_references() {
            if let Some(id) = self.graph.node_weight(edge.target()) {
                *degrees.entry(id.clone()).or_insert(0) += 1;
            }
        }
        degrees
    }

    /// Direct upstream dependencies of an action, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is unknown.
    pub fn upstream(&self, id: &ActionId) -> Result<Vec<ActionId>> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct downstream dependents of an action, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is unknown.
    pub fn downstream(&self, id: &ActionId) -> Result<Vec<ActionId>> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// All transitive dependents of an action (excluding the action
    /// itself).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is unknown.
    pub fn descendants(&self, id: &ActionId) -> Result<Vec<ActionId>> {
        let start = self.index(id)?;
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut result: Vec<NodeIndex> = seen.into_iter().collect();
        result.sort_by_key(|n| {
            self.insertion_order
                .iter()
                .position(|&i| i == *n)
                .unwrap_or(usize::MAX)
        });
        Ok(result
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect())
    }

    fn neighbors(&self, id: &ActionId, direction: Direction) -> Result<Vec<ActionId>> {
        let idx = self.index(id)?;
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort_by_key(|n| {
            self.insertion_order
                .iter()
                .position(|&i| i == *n)
                .unwrap_or(usize::MAX)
        });
        Ok(neighbors
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ActionId {
        ActionId::new(s)
    }

    #[test]
    fn empty_dag_sorts_to_nothing() {
        let dag = ActionDag::new();
        assert!(dag.toposort().unwrap().is_empty());
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let mut dag = ActionDag::new();
        dag.add_node(id("a"));
        dag.add_node(id("b"));
        dag.add_node(id("c"));
        dag.add_edge(&id("a"), &id("b")).unwrap();
        dag.add_edge(&id("b"), &id("c")).unwrap();
        assert_eq!(dag.toposort().unwrap(), vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn toposort_breaks_ties_by_insertion_order() {
        let mut dag = ActionDag::new();
        dag.add_node(id("b"));
        dag.add_node(id("a"));
        dag.add_node(id("c"));
        dag.add_edge(&id("b"), &id("c")).unwrap();
        dag.add_edge(&id("a"), &id("c")).unwrap();
        assert_eq!(dag.toposort().unwrap(), vec![id("b"), id("a"), id("c")]);
    }

    #[test]
    fn cycle_is_reported_with_offender() {
        let mut dag = ActionDag::new();
        dag.add_node(id("a"));
        dag.add_node(id("b"));
        dag.add_edge(&id("a"), &id("b")).unwrap();
        dag.add_edge(&id("b"), &id("a")).unwrap();
        let err = dag.toposort().unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn recursive_edges_do_not_create_cycles() {
        let mut dag = ActionDag::new();
        dag.add_node(id("a"));
        dag.add_node(id("b"));
        dag.add_edge(&id("a"), &id("b")).unwrap();
        // b reads and writes the same object that feeds a: state-only edge.
        dag.add_recursive_edge(id("b"), id("a"));
        assert_eq!(dag.toposort().unwrap(), vec![id("a"), id("b")]);
        assert_eq!(dag.recursive_edges().len(), 1);
    }

    #[test]
    fn duplicate_edges_are_collapsed() {
        let mut dag = ActionDag::new();
        dag.add_node(id("a"));
        dag.add_node(id("b"));
        dag.add_edge(&id("a"), &id("b")).unwrap();
        dag.add_edge(&id("a"), &id("b")).unwrap();
        assert_eq!(dag.in_degrees()[&id("b")], 1);
    }

    #[test]
    fn descendants_are_transitive() {
        let mut dag = ActionDag::new();
        for name in ["a", "b", "c", "d"] {
            dag.add_node(id(name));
        }
        dag.add_edge(&id("a"), &id("b")).unwrap();
        dag.add_edge(&id("b"), &id("c")).unwrap();
        dag.add_edge(&id("a"), &id("d")).unwrap();
        assert_eq!(
            dag.descendants(&id("a")).unwrap(),
            vec![id("b"), id("c"), id("d")]
        );
        assert!(dag.descendants(&id("c")).unwrap().is_empty());
    }

    #[test]
    fn upstream_and_downstream() {
        let mut dag = ActionDag::new();
        dag.add_node(id("a"));
        dag.add_node(id("b"));
        dag.add_node(id("c"));
        dag.add_edge(&id("a"), &id("c")).unwrap();
        dag.add_edge(&id("b"), &id("c")).unwrap();
        assert_eq!(dag.upstream(&id("c")).unwrap(), vec![id("a"), id("b")]);
        assert_eq!(dag.downstream(&id("a")).unwrap(), vec![id("c")]);
    }

    #[test]
    fn unknown_action_is_config_error() {
        let dag = ActionDag::new();
        let err = dag.upstream(&id("ghost")).unwrap_err();
        assert!(matches!(err, OrchestrationError::Config(_)));
    }
}

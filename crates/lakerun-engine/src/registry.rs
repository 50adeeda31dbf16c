//! Instance registry.
//!
//! Holds every configured data object, connection, and action. Populated
//! once during configuration parsing (or programmatically when embedding),
//! read-only during execution. Validation rejects dangling references,
//! missing capabilities, and cyclic dependency graphs before anything
//! runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::{ActionId, ConnectionId, DataObjectId};

use crate::action::Action;
use crate::connection::Connection;
use crate::dag::ActionDag;
use crate::dataobject::DataObject;

/// Registry of all configured instances.
#[derive(Default)]
pub struct InstanceRegistry {
    data_objects: HashMap<DataObjectId, Arc<dyn DataObject>>,
    connections: HashMap<ConnectionId, Arc<dyn Connection>>,
    actions: Vec<Arc<Action>>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("data_objects", &self.data_objects.keys().collect::<Vec<_>>())
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("actions", &self.actions)
            .finish()
    }
}

impl InstanceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data object.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is already taken.
    pub fn register_data_object(&mut self, object: Arc<dyn DataObject>) -> Result<()> {
        let id = object.id().clone();
        if self.data_objects.insert(id.clone(), object).is_some() {
            return Err(OrchestrationError::Config(format!(
                "duplicate data object id '{id}'"
            )));
        }
        Ok(())
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is already taken.
    pub fn register_connection(&mut self, connection: Arc<dyn Connection>) -> Result<()> {
        let id = connection.id().clone();
        if self.connections.insert(id.clone(), connection).is_some() {
            return Err(OrchestrationError::Config(format!(
                "duplicate connection id '{id}'"
            )));
        }
        Ok(())
    }

    /// Register an action. Declaration order is preserved.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is already taken.
    pub fn register_action(&mut self, action: Action) -> Result<()> {
        if self.actions.iter().any(|a| a.id == action.id) {
            return Err(OrchestrationError::Config(format!(
                "duplicate action id '{}'",
                action.id
            )));
        }
        self.actions.push(Arc::new(action));
        Ok(())
    }

    /// Look up a data object.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown id.
    pub fn data_object(&self, id: &DataObjectId) -> Result<Arc<dyn DataObject>> {
        self.data_objects.get(id).cloned().ok_or_else(|| {
            OrchestrationError::Config(format!("unknown data object '{id}'"))
        })
    }

    /// Look up a connection.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown id.
    pub fn connection(&self, id: &ConnectionId) -> Result<Arc<dyn Connection>> {
        self.connections.get(id).cloned().ok_or_else(|| {
            OrchestrationError::Config(format!("unknown connection '{id}'"))
        })
    }

    /// All connections, in arbitrary order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.values().cloned().collect()
    }

    /// All actions in declaration order.
    #[must_use]
    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    /// Look up an action.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown id.
    pub fn action(&self, id: &ActionId) -> Result<Arc<Action>> {
        self.actions
            .iter()
            .find(|a| a.id == *id)
            .cloned()
            .ok_or_else(|| OrchestrationError::Config(format!("unknown action '{id}'")))
    }

    /// Actions whose feed (or id, for actions without feed metadata)
    /// matches the selector regex.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the selector is not a valid regex.
    pub fn select_actions(&self, feed_sel: &str) -> Result<Vec<Arc<Action>>> {
        let selector = regex::Regex::new(feed_sel).map_err(|e| {
            OrchestrationError::Config(format!("invalid feed selector '{feed_sel}': {e}"))
        })?;
        Ok(self
            .actions
            .iter()
            .filter(|action| {
                let feed = action.metadata.feed.as_deref();
                feed.map_or_else(
                    || selector.is_match(action.id.as_str()),
                    |f| selector.is_match(f),
                )
            })
            .cloned()
            .collect())
    }

    /// Build the dependency graph over `actions`: an edge A -> B for every
    /// data object written by A and read by B. Recursive inputs go into
    /// the auxiliary edge set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the graph contains a cycle among
    /// dependency edges.
    pub fn build_dag(&self, actions: &[Arc<Action>]) -> Result<ActionDag> {
        let mut dag = ActionDag::new();
        for action in actions {
            dag.add_node(action.id.clone());
        }
        let mut producers: HashMap<&DataObjectId, &ActionId> = HashMap::new();
        for action in actions {
            for output in &action.outputs {
                producers.insert(output, &action.id);
            }
        }
        for action in actions {
            for input in &action.inputs {
                if let Some(&producer) = producers.get(input) {
                    if *producer != action.id {
                        dag.add_edge(producer, &action.id)?;
                    }
                }
            }
            for recursive in &action.recursive_inputs {
                if let Some(&producer) = producers.get(recursive) {
                    dag.add_recursive_edge(producer.clone(), action.id.clone());
                }
            }
        }
        // Surfaces cycles among dependency edges.
        dag.toposort()?;
        Ok(dag)
    }

    /// Data objects consumed by `actions` but produced by none of them:
    /// the DAG-start inputs whose subfeeds the driver synthesises.
    #[must_use]
    pub fn dag_start_objects(&self, actions: &[Arc<Action>]) -> Vec<DataObjectId> {
        let produced: HashSet<&DataObjectId> = actions
            .iter()
            .flat_map(|a| a.outputs.iter())
            .collect();
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for action in actions {
            for input in &action.inputs {
                if !produced.contains(input) && seen.insert(input.clone()) {
                    result.push(input.clone());
                }
            }
        }
        result
    }

    /// Validate the full object graph for a selected action set: id
    /// references resolve, required capabilities are present, the
    /// dependency graph is acyclic, and each action's own configuration is
    /// consistent.
    ///
    /// # Errors
    ///
    /// Returns a configuration error listing the first violation found.
    pub fn validate(&self, actions: &[Arc<Action>]) -> Result<()> {
        for action in actions {
            action.validate_config(self)?;
        }
        self.build_dag(actions)?;
        Ok(())
    }
}

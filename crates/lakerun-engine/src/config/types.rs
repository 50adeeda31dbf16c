//! Configuration schema.
//!
//! Serde types for the YAML pipeline description. Defaults are chosen so
//! minimal configurations stay minimal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dataobject::SaveMode;

fn default_version() -> String {
    "1.0".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_max_batches() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Top-level pipeline description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub data_objects: BTreeMap<String, DataObjectConfig>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionConfig>,
}

impl PipelineConfig {
    /// Merge another configuration file into this one. Later files win on
    /// id collisions.
    #[must_use]
    pub fn merged(mut self, other: Self) -> Self {
        self.connections.extend(other.connections);
        self.data_objects.extend(other.data_objects);
        self.actions.extend(other.actions);
        self
    }
}

/// Connection declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ConnectionConfig {
    /// Local directory tree with a bounded session pool.
    LocalDir {
        /// May carry a `PROVIDER#KEY` secret reference.
        base_path: String,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
        #[serde(default = "default_max_idle_secs")]
        max_idle_secs: u64,
    },
}

/// Data-object declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum DataObjectConfig {
    /// Partitioned in-memory table.
    MemoryTable {
        #[serde(default)]
        partition_columns: Vec<String>,
        #[serde(default)]
        primary_key: Vec<String>,
        #[serde(default)]
        save_mode: SaveMode,
    },
    /// JSON-lines files under partition directories.
    JsonFile {
        /// Base path, relative to `connection` when one is given. May
        /// carry a `PROVIDER#KEY` secret reference.
        path: String,
        #[serde(default)]
        connection: Option<String>,
        #[serde(default)]
        partition_columns: Vec<String>,
        #[serde(default)]
        save_mode: SaveMode,
    },
    /// Ordered in-memory batch queue for streaming reads.
    MemoryStream {},
}

/// Execution-mode declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ExecutionModeConfig {
    FixedPartitionValues {
        partition_values: Vec<BTreeMap<String, String>>,
    },
    PartitionDiff {
        #[serde(default)]
        partition_col_nb: Option<usize>,
        #[serde(default)]
        alternative_output_id: Option<String>,
        #[serde(default)]
        nb_of_partition_values_per_run: Option<usize>,
        #[serde(default)]
        apply_condition: Option<String>,
        #[serde(default)]
        select_expression: Option<String>,
        #[serde(default)]
        fail_condition: Option<String>,
    },
    Incremental {
        compare_col: String,
    },
    StreamingOnce {
        checkpoint_path: String,
        #[serde(default = "default_max_batches")]
        max_batches: usize,
    },
    FailIfNoPartitionValues,
    ProcessAll,
}

/// Transformer declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TransformerConfig {
    /// Row predicate over the named subfeed (or all subfeeds).
    Filter {
        predicate: String,
        #[serde(default)]
        subfeed: Option<String>,
    },
}

/// Free-form action metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataConfig {
    #[serde(default)]
    pub feed: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Action declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub recursive_inputs: Vec<String>,
    #[serde(default)]
    pub main_input: Option<String>,
    #[serde(default)]
    pub main_output: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionModeConfig>,
    #[serde(default)]
    pub execution_condition: Option<String>,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub transformers: Vec<TransformerConfig>,
    /// Static transformer options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Runtime transformer options: name to expression.
    #[serde(default)]
    pub runtime_options: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs_to_ignore_filter: Vec<String>,
    #[serde(default = "default_true")]
    pub handle_recursive_inputs_as_subfeeds: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_action_parses_with_defaults() {
        let yaml = r"
inputs: [src]
outputs: [tgt]
";
        let action: ActionConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(action.execution_mode.is_none());
        assert!(action.handle_recursive_inputs_as_subfeeds);
        assert!(action.transformers.is_empty());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let yaml = r"
inputs: [src]
outputs: [tgt]
not_a_field: true
";
        assert!(serde_yaml::from_str::<ActionConfig>(yaml).is_err());
    }

    #[test]
    fn mode_tag_parses() {
        let yaml = r"
type: partition_diff
partition_col_nb: 1
";
        let mode: ExecutionModeConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            mode,
            ExecutionModeConfig::PartitionDiff {
                partition_col_nb: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn merged_later_files_win() {
        let base: PipelineConfig = serde_yaml::from_str(
            r"
data_objects:
  src: { type: memory_table }
",
        )
        .unwrap();
        let overlay: PipelineConfig = serde_yaml::from_str(
            r"
data_objects:
  src: { type: memory_table, partition_columns: [dt] }
  tgt: { type: memory_table }
",
        )
        .unwrap();
        let merged = base.merged(overlay);
        assert_eq!(merged.data_objects.len(), 2);
        assert!(matches!(
            &merged.data_objects["src"],
            DataObjectConfig::MemoryTable { partition_columns, .. } if partition_columns == &vec!["dt".to_string()]
        ));
    }
}

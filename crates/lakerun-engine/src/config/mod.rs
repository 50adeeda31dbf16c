//! Configuration layer.
//!
//! Parses YAML pipeline descriptions (with `${VAR}` environment
//! substitution and `PROVIDER#KEY` secret references), validates them, and
//! materialises the instance registry the engine runs against.

pub mod parser;
pub mod secrets;
pub mod types;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use lakerun_types::error::{OrchestrationError, Result};

use crate::action::Action;
use crate::connection::LocalDirConnection;
use crate::dataobject::{
    JsonFileDataObject, MemoryStreamDataObject, MemoryTableDataObject,
};
use crate::mode::{ExecutionMode, PartitionDiffConfig};
use crate::registry::InstanceRegistry;
use crate::transformer::{Transformer, TransformerChain};
use lakerun_types::PartitionValues;

use self::secrets::SecretProviderRegistry;
use self::types::{
    ActionConfig, ConnectionConfig, DataObjectConfig, ExecutionModeConfig, PipelineConfig,
    TransformerConfig,
};

/// Build the instance registry from a validated configuration.
///
/// # Errors
///
/// Returns a configuration error for unresolvable references or secret
/// lookups.
pub fn build_registry(
    config: &PipelineConfig,
    secrets: &SecretProviderRegistry,
) -> Result<InstanceRegistry> {
    validator::validate_config(config)?;
    let mut registry = InstanceRegistry::new();

    let mut local_dirs = std::collections::BTreeMap::new();
    for (id, connection) in &config.connections {
        match connection {
            ConnectionConfig::LocalDir {
                base_path,
                pool_size,
                max_idle_secs,
            } => {
                let resolved = secrets.resolve_value(base_path)?;
                let conn = Arc::new(LocalDirConnection::new(
                    id.clone(),
                    resolved,
                    *pool_size,
                    Duration::from_secs(*max_idle_secs),
                ));
                local_dirs.insert(id.clone(), conn.clone());
                registry.register_connection(conn)?;
            }
        }
    }

    for (id, object) in &config.data_objects {
        match object {
            DataObjectConfig::MemoryTable {
                partition_columns,
                primary_key,
                save_mode,
            } => {
                let table = MemoryTableDataObject::new(id.clone())
                    .with_partition_columns(partition_columns.clone())
                    .with_primary_key(primary_key.clone())
                    .with_save_mode(*save_mode);
                registry.register_data_object(Arc::new(table))?;
            }
            DataObjectConfig::JsonFile {
                path,
                connection,
                partition_columns,
                save_mode,
            } => {
                let resolved = secrets.resolve_value(path)?;
                let base = match connection {
                    Some(conn_id) => {
                        let conn = local_dirs.get(conn_id).ok_or_else(|| {
                            OrchestrationError::Config(format!(
                                "data object '{id}': unknown connection '{conn_id}'"
                            ))
                        })?;
                        conn.base_path().join(&resolved)
                    }
                    None => resolved.into(),
                };
                let object = JsonFileDataObject::new(id.clone(), base)
                    .with_partition_columns(partition_columns.clone())
                    .with_save_mode(*save_mode);
                registry.register_data_object(Arc::new(object))?;
            }
            DataObjectConfig::MemoryStream {} => {
                registry.register_data_object(Arc::new(MemoryStreamDataObject::new(id.clone())))?;
            }
        }
    }

    for (id, action) in &config.actions {
        registry.register_action(build_action(id, action)?)?;
    }

    Ok(registry)
}

fn build_action(id: &str, config: &ActionConfig) -> Result<Action> {
    let mut action = Action::new(
        id,
        config.inputs.iter().map(Into::into).collect(),
        config.outputs.iter().map(Into::into).collect(),
    );
    action.recursive_inputs = config.recursive_inputs.iter().map(Into::into).collect();
    action.main_input_id = config.main_input.as_deref().map(Into::into);
    action.main_output_id = config.main_output.as_deref().map(Into::into);
    action.execution_condition = config.execution_condition.clone();
    action.input_ids_to_ignore_filter = config
        .inputs_to_ignore_filter
        .iter()
        .map(Into::into)
        .collect();
    action.handle_recursive_inputs_as_subfeeds = config.handle_recursive_inputs_as_subfeeds;
    action.metadata.feed = config.metadata.feed.clone();
    action.metadata.name = config.metadata.name.clone();
    action.metadata.description = config.metadata.description.clone();
    action.metadata.tags = config.metadata.tags.clone();

    if let Some(mode) = &config.execution_mode {
        action.execution_mode = Some(build_mode(mode));
    }

    let mut chain = TransformerChain::new();
    for (name, value) in &config.options {
        chain = chain.with_static_option(name.clone(), value.clone());
    }
    for (name, expr) in &config.runtime_options {
        chain = chain.with_runtime_option(name.clone(), expr.clone());
    }
    for transformer in &config.transformers {
        match transformer {
            TransformerConfig::Filter { predicate, subfeed } => {
                chain = chain.with(Transformer::Filter {
                    subfeed_name: subfeed.clone(),
                    predicate: predicate.clone(),
                });
            }
        }
    }
    action.transformers = chain;
    Ok(action)
}

fn build_mode(config: &ExecutionModeConfig) -> ExecutionMode {
    match config {
        ExecutionModeConfig::FixedPartitionValues { partition_values } => {
            ExecutionMode::FixedPartitionValues {
                partition_values: partition_values
                    .iter()
                    .map(|pairs| PartitionValues::from_pairs(pairs.clone()))
                    .collect(),
            }
        }
        ExecutionModeConfig::PartitionDiff {
            partition_col_nb,
            alternative_output_id,
            nb_of_partition_values_per_run,
            apply_condition,
            select_expression,
            fail_condition,
        } => ExecutionMode::PartitionDiff(PartitionDiffConfig {
            partition_col_nb: *partition_col_nb,
            alternative_output_id: alternative_output_id.as_deref().map(Into::into),
            nb_of_partition_values_per_run: *nb_of_partition_values_per_run,
            apply_condition: apply_condition.clone(),
            select_expression: select_expression.clone(),
            fail_condition: fail_condition.clone(),
        }),
        ExecutionModeConfig::Incremental { compare_col } => ExecutionMode::Incremental {
            compare_col: compare_col.clone(),
        },
        ExecutionModeConfig::StreamingOnce {
            checkpoint_path,
            max_batches,
        } => ExecutionMode::StreamingOnce {
            checkpoint_path: checkpoint_path.into(),
            max_batches: *max_batches,
        },
        ExecutionModeConfig::FailIfNoPartitionValues => ExecutionMode::FailIfNoPartitionValues,
        ExecutionModeConfig::ProcessAll => ExecutionMode::ProcessAll,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_registry_from_yaml() {
        let yaml = r#"
version: "1.0"
data_objects:
  src:
    type: memory_table
    partition_columns: [dt]
  tgt:
    type: memory_table
    partition_columns: [dt]
actions:
  copy:
    inputs: [src]
    outputs: [tgt]
    metadata:
      feed: compute
    execution_mode:
      type: partition_diff
      partition_col_nb: 1
"#;
        let config = parser::parse_config_str(yaml).unwrap();
        let registry =
            build_registry(&config, &SecretProviderRegistry::with_builtins()).unwrap();
        assert_eq!(registry.actions().len(), 1);
        let action = registry.action(&"copy".into()).unwrap();
        assert_eq!(action.metadata.feed.as_deref(), Some("compute"));
        assert!(matches!(
            action.execution_mode,
            Some(ExecutionMode::PartitionDiff(_))
        ));
        registry.validate(registry.actions()).unwrap();
    }

    #[test]
    fn json_file_resolves_against_connection() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
version: "1.0"
connections:
  store:
    type: local_dir
    base_path: "{}"
data_objects:
  files:
    type: json_file
    connection: store
    path: tbl
actions:
  load:
    inputs: [files]
    outputs: [files]
"#,
            dir.path().display()
        );
        let config = parser::parse_config_str(&yaml).unwrap();
        let registry =
            build_registry(&config, &SecretProviderRegistry::with_builtins()).unwrap();
        assert!(registry.data_object(&"files".into()).is_ok());
        assert!(registry.connection(&"store".into()).is_ok());
    }

    #[test]
    fn unknown_connection_reference_is_config_error() {
        let yaml = r#"
version: "1.0"
data_objects:
  files:
    type: json_file
    connection: ghost
    path: tbl
"#;
        let config = parser::parse_config_str(yaml).unwrap();
        let err =
            build_registry(&config, &SecretProviderRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, OrchestrationError::Config(_)));
    }

    #[test]
    fn filter_transformer_is_wired() {
        let yaml = r#"
version: "1.0"
data_objects:
  src: { type: memory_table }
  tgt: { type: memory_table }
actions:
  copy:
    inputs: [src]
    outputs: [tgt]
    options:
      min_rating: "4"
    transformers:
      - type: filter
        predicate: "rating > %{min_rating}"
"#;
        let config = parser::parse_config_str(yaml).unwrap();
        let registry =
            build_registry(&config, &SecretProviderRegistry::with_builtins()).unwrap();
        let action = registry.action(&"copy".into()).unwrap();
        assert!(!action.transformers.is_identity());
    }
}

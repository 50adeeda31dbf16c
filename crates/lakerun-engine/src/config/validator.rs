//! Semantic validation for parsed configuration values.
//!
//! Collects every violation before reporting, so one run surfaces all
//! problems at once.

use lakerun_types::error::{OrchestrationError, Result};

use crate::config::types::{
    ActionConfig, DataObjectConfig, ExecutionModeConfig, PipelineConfig,
};

const SUPPORTED_VERSION: &str = "1.0";

/// Validate a parsed configuration.
///
/// # Errors
///
/// Returns a configuration error listing all validation failures found.
pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != SUPPORTED_VERSION {
        errors.push(format!(
            "unsupported configuration version '{}', expected '{SUPPORTED_VERSION}'",
            config.version
        ));
    }

    for (id, object) in &config.data_objects {
        if let DataObjectConfig::JsonFile {
            path, connection, ..
        } = object
        {
            if path.trim().is_empty() {
                errors.push(format!("data object '{id}': path must not be empty"));
            }
            if let Some(conn) = connection {
                if !config.connections.contains_key(conn) {
                    errors.push(format!(
                        "data object '{id}': unknown connection '{conn}'"
                    ));
                }
            }
        }
    }

    for (id, action) in &config.actions {
        validate_action(id, action, config, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchestrationError::Config(errors.join("; ")))
    }
}

fn validate_action(
    id: &str,
    action: &ActionConfig,
    config: &PipelineConfig,
    errors: &mut Vec<String>,
) {
    if action.inputs.is_empty() {
        errors.push(format!("action '{id}': must declare at least one input"));
    }
    if action.outputs.is_empty() {
        errors.push(format!("action '{id}': must declare at least one output"));
    }
    for reference in action
        .inputs
        .iter()
        .chain(action.outputs.iter())
        .chain(action.recursive_inputs.iter())
    {
        if !config.data_objects.contains_key(reference) {
            errors.push(format!("action '{id}': unknown data object '{reference}'"));
        }
    }
    for recursive in &action.recursive_inputs {
        if !action.outputs.contains(recursive) {
            errors.push(format!(
                "action '{id}': recursive input '{recursive}' must also be an output"
            ));
        }
    }
    if let Some(main_input) = &action.main_input {
        if !action.inputs.contains(main_input) {
            errors.push(format!(
                "action '{id}': main input '{main_input}' is not among its inputs"
            ));
        }
    }
    if let Some(main_output) = &action.main_output {
        if !action.outputs.contains(main_output) {
            errors.push(format!(
                "action '{id}': main output '{main_output}' is not among its outputs"
            ));
        }
    }
    match &action.execution_mode {
        Some(ExecutionModeConfig::Incremental { compare_col }) => {
            if compare_col.trim().is_empty() {
                errors.push(format!(
                    "action '{id}': incremental mode needs a compare column"
                ));
            }
        }
        Some(ExecutionModeConfig::PartitionDiff {
            partition_col_nb,
            alternative_output_id,
            nb_of_partition_values_per_run,
            ..
        }) => {
            if *partition_col_nb == Some(0) {
                errors.push(format!(
                    "action '{id}': partition_col_nb must be at least 1"
                ));
            }
            if *nb_of_partition_values_per_run == Some(0) {
                errors.push(format!(
                    "action '{id}': nb_of_partition_values_per_run must be at least 1"
                ));
            }
            if let Some(alternative) = alternative_output_id {
                if !config.data_objects.contains_key(alternative) {
                    errors.push(format!(
                        "action '{id}': unknown alternative output '{alternative}'"
                    ));
                }
            }
        }
        Some(ExecutionModeConfig::StreamingOnce {
            checkpoint_path, ..
        }) => {
            if checkpoint_path.trim().is_empty() {
                errors.push(format!(
                    "action '{id}': streaming mode needs a checkpoint path"
                ));
            }
        }
        _ => {}
    }
}

//! Configuration parsing with environment variable substitution.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;

use lakerun_types::error::{OrchestrationError, Result};

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns a configuration error naming every referenced variable that is
/// not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => missing.push(var_name.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(OrchestrationError::Config(format!(
            "missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(result)
}

/// Parse a configuration YAML string (after env var substitution).
///
/// # Errors
///
/// Returns a configuration error if substitution fails or the YAML is
/// invalid.
pub fn parse_config_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    serde_yaml::from_str(&substituted)
        .map_err(|e| OrchestrationError::Config(format!("invalid configuration: {e}")))
}

/// Parse one configuration file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn parse_config_file(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    parse_config_str(&content)
}

/// Parse and merge a list of configuration files or directories.
/// Directories contribute their `*.yaml` / `*.yml` files in name order;
/// later entries win on id collisions.
///
/// # Errors
///
/// Returns an error if any path is unreadable or any file invalid.
pub fn parse_config_paths(paths: &[impl AsRef<Path>]) -> Result<PipelineConfig> {
    let mut merged = PipelineConfig::default();
    let mut seen_any = false;
    for path in paths {
        let path = path.as_ref();
        if path.is_dir() {
            let mut files: Vec<_> = std::fs::read_dir(path)
                .with_context(|| format!("failed to list {}", path.display()))?
                .filter_map(std::result::Result::ok)
                .map(|entry| entry.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == "yaml" || e == "yml")
                })
                .collect();
            files.sort();
            for file in files {
                merged = merged.merged(parse_config_file(&file)?);
                seen_any = true;
            }
        } else {
            merged = merged.merged(parse_config_file(path)?);
            seen_any = true;
        }
    }
    if !seen_any {
        return Err(OrchestrationError::Config(
            "no configuration files found".to_string(),
        ));
    }
    Ok(merged)
}

/// Stable digest of the configuration, recorded in state files so a
/// recovery attempt can tell whether the configuration changed.
#[must_use]
pub fn config_digest(config: &PipelineConfig) -> String {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_substitution() {
        std::env::set_var("LR_TEST_PATH", "/data/store");
        let input = "base_path: ${LR_TEST_PATH}";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "base_path: /data/store");
        std::env::remove_var("LR_TEST_PATH");
    }

    #[test]
    fn missing_env_vars_all_reported() {
        let input = "${LR_MISSING_X} and ${LR_MISSING_Y}";
        let err = substitute_env_vars(input).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("LR_MISSING_X"));
        assert!(msg.contains("LR_MISSING_Y"));
    }

    #[test]
    fn no_env_vars_passthrough() {
        let input = "version: '1.0'";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn parse_invalid_yaml_is_config_error() {
        let err = parse_config_str("actions: [not: a: map").unwrap_err();
        assert!(matches!(err, OrchestrationError::Config(_)));
    }

    #[test]
    fn parse_paths_merges_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10_objects.yaml"),
            "data_objects:\n  src: { type: memory_table }\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20_actions.yaml"),
            "data_objects:\n  tgt: { type: memory_table }\nactions:\n  copy:\n    inputs: [src]\n    outputs: [tgt]\n",
        )
        .unwrap();
        let config = parse_config_paths(&[dir.path()]).unwrap();
        assert_eq!(config.data_objects.len(), 2);
        assert_eq!(config.actions.len(), 1);
    }

    #[test]
    fn parse_paths_empty_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_config_paths(&[dir.path()]).unwrap_err();
        assert!(matches!(err, OrchestrationError::Config(_)));
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let a = parse_config_str("data_objects:\n  src: { type: memory_table }\n").unwrap();
        let b = parse_config_str("data_objects:\n  src: { type: memory_table }\n").unwrap();
        let c =
            parse_config_str("data_objects:\n  other: { type: memory_table }\n").unwrap();
        assert_eq!(config_digest(&a), config_digest(&b));
        assert_ne!(config_digest(&a), config_digest(&c));
    }
}

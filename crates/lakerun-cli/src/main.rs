use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use lakerun_engine::config::{self, parser, secrets::SecretProviderRegistry};
use lakerun_engine::{run_application, AppOptions, TestMode};
use lakerun_state::RetentionPolicy;
use lakerun_types::error::OrchestrationError;
use lakerun_types::PartitionValues;

#[derive(Parser)]
#[command(name = "lakerun", version, about = "Declarative data-pipeline orchestrator")]
struct Cli {
    /// Select actions whose feed matches this regex
    #[arg(short = 'f', long = "feed-sel")]
    feed_sel: String,

    /// Application name (state-store key); defaults to the feed selector
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Configuration files or directories (comma-separated)
    #[arg(short = 'c', long = "config", value_delimiter = ',', required = true)]
    config: Vec<PathBuf>,

    /// Single-column partition filter: COL=V[,V...]
    #[arg(long = "partition-values")]
    partition_values: Option<String>,

    /// Multi-column partition filter: COL1=V,COL2=V[;...]
    #[arg(long = "multi-partition-values")]
    multi_partition_values: Option<String>,

    /// Scheduler worker count
    #[arg(long = "parallelism", default_value_t = 1)]
    parallelism: usize,

    /// State-store root directory; enables recovery
    #[arg(long = "state-path")]
    state_path: Option<PathBuf>,

    /// Keep at most this many state files per application
    #[arg(long = "state-retention-files")]
    state_retention_files: Option<usize>,

    /// Keep executing independent branches after a failure
    #[arg(long = "continue-on-failure", default_value_t = false)]
    continue_on_failure: bool,

    /// Per-action timeout in seconds
    #[arg(long = "action-timeout-secs")]
    action_timeout_secs: Option<u64>,

    /// Stop after prepare (config) or init (dry-run)
    #[arg(long = "test", value_enum)]
    test: Option<TestModeArg>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum TestModeArg {
    Config,
    DryRun,
}

impl From<TestModeArg> for TestMode {
    fn from(arg: TestModeArg) -> Self {
        match arg {
            TestModeArg::Config => Self::Config,
            TestModeArg::DryRun => Self::DryRun,
        }
    }
}

/// Parse `COL=V[,V...]` into one record per value.
fn parse_partition_values(spec: &str) -> Result<Vec<PartitionValues>, OrchestrationError> {
    let (column, values) = spec.split_once('=').ok_or_else(|| {
        OrchestrationError::Config(format!(
            "invalid --partition-values '{spec}', expected COL=V[,V...]"
        ))
    })?;
    Ok(values
        .split(',')
        .filter(|v| !v.is_empty())
        .map(|value| PartitionValues::single(column, value))
        .collect())
}

/// Parse `COL1=V,COL2=V[;...]` into one record per `;`-separated group.
fn parse_multi_partition_values(spec: &str) -> Result<Vec<PartitionValues>, OrchestrationError> {
    let mut records = Vec::new();
    for group in spec.split(';').filter(|g| !g.is_empty()) {
        let mut pairs = Vec::new();
        for pair in group.split(',') {
            let (column, value) = pair.split_once('=').ok_or_else(|| {
                OrchestrationError::Config(format!(
                    "invalid --multi-partition-values entry '{pair}', expected COL=V"
                ))
            })?;
            pairs.push((column.to_string(), value.to_string()));
        }
        records.push(PartitionValues::from_pairs(pairs));
    }
    Ok(records)
}

async fn run(cli: Cli) -> Result<i32, OrchestrationError> {
    let pipeline_config = parser::parse_config_paths(&cli.config)?;
    let digest = parser::config_digest(&pipeline_config);
    let secrets = SecretProviderRegistry::with_builtins();
    let registry = Arc::new(config::build_registry(&pipeline_config, &secrets)?);

    let mut partition_values = Vec::new();
    if let Some(spec) = &cli.partition_values {
        partition_values.extend(parse_partition_values(spec)?);
    }
    if let Some(spec) = &cli.multi_partition_values {
        partition_values.extend(parse_multi_partition_values(spec)?);
    }

    let options = AppOptions {
        app_name: cli.name.clone().unwrap_or_else(|| cli.feed_sel.clone()),
        feed_sel: cli.feed_sel.clone(),
        partition_values,
        parallelism: cli.parallelism,
        fail_fast: !cli.continue_on_failure,
        state_path: cli.state_path.clone(),
        state_retention: RetentionPolicy {
            max_files: cli.state_retention_files,
            max_age: None,
        },
        test_mode: cli.test.map(Into::into),
        action_timeout: cli.action_timeout_secs.map(std::time::Duration::from_secs),
        config_digest: Some(digest),
    };

    let summary = run_application(registry, options).await?;
    Ok(summary.exit_code())
}

/// `RUST_LOG` wins over `--log-level`; an unparseable level falls back to
/// info rather than aborting the run.
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(2)),
        Err(err) => {
            tracing::error!(category = err.category(), "{err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(2))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_values_single_column_fan_out() {
        let values = parse_partition_values("dt=20180101,20190101").unwrap();
        assert_eq!(
            values,
            vec![
                PartitionValues::single("dt", "20180101"),
                PartitionValues::single("dt", "20190101"),
            ]
        );
    }

    #[test]
    fn partition_values_without_equals_is_error() {
        assert!(parse_partition_values("dt").is_err());
    }

    #[test]
    fn multi_partition_values_grouped_by_semicolon() {
        let values =
            parse_multi_partition_values("dt=20180101,type=person;dt=20190101,type=company")
                .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].get("dt"), Some("20180101"));
        assert_eq!(values[0].get("type"), Some("person"));
        assert_eq!(values[1].get("type"), Some("company"));
    }

    #[test]
    fn cli_parses_spec_surface() {
        let cli = Cli::parse_from([
            "lakerun",
            "-f",
            "^compute$",
            "-c",
            "conf/a.yaml,conf/b.yaml",
            "--partition-values",
            "dt=20180101",
            "--parallelism",
            "4",
            "--state-path",
            "/tmp/state",
            "--test",
            "dry-run",
        ]);
        assert_eq!(cli.feed_sel, "^compute$");
        assert_eq!(cli.config.len(), 2);
        assert_eq!(cli.parallelism, 4);
        assert!(matches!(cli.test, Some(TestModeArg::DryRun)));
    }
}

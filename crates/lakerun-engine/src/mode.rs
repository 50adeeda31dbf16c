//! Execution modes.
//!
//! An execution mode decides *which data* an action processes: the
//! partition values and row filter applied to the main input. Modes are
//! declarative: each returns a [`ModeResult`] and the action kernel
//! rewrites the subfeeds uniformly. `post_exec` is the only hook that sees
//! the main input/output pair after writing; streaming uses it to advance
//! its checkpoint.

use std::path::PathBuf;
use std::sync::Arc;

use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::expression::{self, ExpressionContext};
use lakerun_types::partition;
use lakerun_types::{ActionId, DataObjectId, PartitionValues, SubFeed};

use crate::dataobject::{self, write_offset, CanHandlePartitions, CanRead, DataObject};

/// Selection computed by a mode: the partition values to process, an
/// optional row filter, and the stream offset to resume from (streaming
/// only).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeResult {
    pub partition_values: Vec<PartitionValues>,
    pub filter: Option<String>,
    pub stream_offset: Option<u64>,
}

impl ModeResult {
    /// Selection of partition values with no row filter.
    #[must_use]
    pub fn partitions(partition_values: Vec<PartitionValues>) -> Self {
        Self {
            partition_values,
            ..Self::default()
        }
    }
}

/// User-supplied partition selection logic.
pub trait CustomModeLogic: Send + Sync {
    /// Compute the selection for `action_id`, or `None` to leave the
    /// incoming subfeed untouched.
    ///
    /// # Errors
    ///
    /// May return any orchestration error; soft no-data errors are handled
    /// like those of the built-in modes.
    fn apply(
        &self,
        action_id: &ActionId,
        main_input_subfeed: &SubFeed,
        ctx: &ExpressionContext,
    ) -> Result<Option<ModeResult>>;
}

/// Configuration of the partition-diff mode.
#[derive(Debug, Clone, Default)]
pub struct PartitionDiffConfig {
    /// Restrict the comparison to the first `k` partition columns of the
    /// main input.
    pub partition_col_nb: Option<usize>,
    /// Compare against this object's partitions instead of the main
    /// output's.
    pub alternative_output_id: Option<DataObjectId>,
    /// Process at most this many partition values per run (oldest first).
    pub nb_of_partition_values_per_run: Option<usize>,
    /// Gate: the mode applies only when this evaluates true.
    pub apply_condition: Option<String>,
    /// Keep only candidates for which this evaluates true.
    pub select_expression: Option<String>,
    /// Abort the run if this evaluates true for any selected candidate.
    pub fail_condition: Option<String>,
}

/// Strategy deciding the partition values and row filter per action.
#[derive(Clone)]
pub enum ExecutionMode {
    /// Values supplied by the driver; absent values mean no filter.
    FixedPartitionValues { partition_values: Vec<PartitionValues> },
    /// Process partitions present in the input but missing in the output.
    PartitionDiff(PartitionDiffConfig),
    /// Select input rows newer than the output's high-water mark.
    Incremental { compare_col: String },
    /// Run one streaming micro-batch, checkpointing the offset on disk.
    StreamingOnce {
        checkpoint_path: PathBuf,
        max_batches: usize,
    },
    /// Fail fast when no partition values arrive.
    FailIfNoPartitionValues,
    /// Clear any incoming selection: full reload.
    ProcessAll,
    /// User-supplied selection function.
    Custom(Arc<dyn CustomModeLogic>),
}

impl std::fmt::Debug for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FixedPartitionValues { partition_values } => f
                .debug_struct("FixedPartitionValues")
                .field("partition_values", partition_values)
                .finish(),
            Self::PartitionDiff(config) => f.debug_tuple("PartitionDiff").field(config).finish(),
            Self::Incremental { compare_col } => f
                .debug_struct("Incremental")
                .field("compare_col", compare_col)
                .finish(),
            Self::StreamingOnce {
                checkpoint_path,
                max_batches,
            } => f
                .debug_struct("StreamingOnce")
                .field("checkpoint_path", checkpoint_path)
                .field("max_batches", max_batches)
                .finish(),
            Self::FailIfNoPartitionValues => f.write_str("FailIfNoPartitionValues"),
            Self::ProcessAll => f.write_str("ProcessAll"),
            Self::Custom(_) => f.debug_struct("Custom").finish_non_exhaustive(),
        }
    }
}

impl ExecutionMode {
    /// Compute the selection for one action. `None` means the incoming
    /// subfeed stands as-is.
    ///
    /// # Errors
    ///
    /// * [`OrchestrationError::NoDataToProcess`] when a diff or stream is
    ///   empty (soft; the kernel converts it into skipped subfeeds).
    /// * [`OrchestrationError::Config`] for missing capabilities or
    ///   unparseable condition expressions.
    /// * [`OrchestrationError::TaskFailed`] when a `fail_condition` fires.
    pub fn apply(
        &self,
        action_id: &ActionId,
        main_input: &dyn DataObject,
        main_output: &dyn DataObject,
        alternative_output: Option<&dyn DataObject>,
        main_input_subfeed: &SubFeed,
        ctx: &ExpressionContext,
    ) -> Result<Option<ModeResult>> {
        match self {
            Self::FixedPartitionValues { partition_values } => {
                if partition_values.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(ModeResult::partitions(partition_values.clone())))
                }
            }
            Self::PartitionDiff(config) => {
                apply_partition_diff(config, action_id, main_input, main_output, alternative_output, ctx)
            }
            Self::Incremental { compare_col } => {
                apply_incremental(compare_col, action_id, main_output, main_input_subfeed)
            }
            Self::StreamingOnce {
                checkpoint_path, ..
            } => {
                let offset = dataobject::read_offset(checkpoint_path)?;
                Ok(Some(ModeResult {
                    partition_values: Vec::new(),
                    filter: None,
                    stream_offset: Some(offset),
                }))
            }
            Self::FailIfNoPartitionValues => {
                if main_input_subfeed.partition_values.is_empty() {
                    Err(OrchestrationError::Config(format!(
                        "action '{action_id}': no partition values given but partition values are required"
                    )))
                } else {
                    Ok(None)
                }
            }
            Self::ProcessAll => Ok(Some(ModeResult::default())),
            Self::Custom(logic) => logic.apply(action_id, main_input_subfeed, ctx),
        }
    }

    /// Hook invoked after the exec write for the main input/output pair.
    /// `stream_next_offset` carries the offset returned by the streaming
    /// read, when one happened.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if checkpoint persistence fails.
    pub fn post_exec(
        &self,
        action_id: &ActionId,
        stream_next_offset: Option<u64>,
    ) -> Result<()> {
        if let Self::StreamingOnce {
            checkpoint_path, ..
        } = self
        {
            if let Some(next) = stream_next_offset {
                write_offset(checkpoint_path, next)?;
                tracing::debug!(
                    action = %action_id,
                    offset = next,
                    checkpoint = %checkpoint_path.display(),
                    "Advanced streaming checkpoint"
                );
            }
        }
        Ok(())
    }

    /// Streaming batch budget, when this is a streaming mode.
    #[must_use]
    pub fn stream_max_batches(&self) -> Option<usize> {
        match self {
            Self::StreamingOnce { max_batches, .. } => Some((*max_batches).max(1)),
            _ => None,
        }
    }
}

fn eval_condition(
    expr: &str,
    ctx: &ExpressionContext,
    what: &str,
    action_id: &ActionId,
) -> Result<bool> {
    expression::evaluate_bool(expr, ctx).map_err(|e| {
        OrchestrationError::Config(format!("action '{action_id}': {what} '{expr}': {e}"))
    })
}

fn apply_partition_diff(
    config: &PartitionDiffConfig,
    action_id: &ActionId,
    main_input: &dyn DataObject,
    main_output: &dyn DataObject,
    alternative_output: Option<&dyn DataObject>,
    ctx: &ExpressionContext,
) -> Result<Option<ModeResult>> {
    if let Some(condition) = &config.apply_condition {
        if !eval_condition(condition, ctx, "apply condition", action_id)? {
            tracing::debug!(action = %action_id, "Partition-diff apply condition false, mode not applied");
            return Ok(None);
        }
    }

    let partitioned_input = main_input.partitioned().ok_or_else(|| {
        OrchestrationError::Config(format!(
            "action '{action_id}': partition-diff mode needs a partitioned main input, '{}' is not",
            main_input.id()
        ))
    })?;
    let input_columns = partitioned_input.partition_columns();
    let nb = config
        .partition_col_nb
        .unwrap_or(input_columns.len())
        .clamp(1, input_columns.len().max(1));
    let compare_columns = &input_columns[..nb.min(input_columns.len())];

    let input_partitions = partitioned_input.list_partitions()?;
    let compare_object = alternative_output.unwrap_or(main_output);
    let output_partitions = compare_object
        .partitioned()
        .map(CanHandlePartitions::list_partitions)
        .transpose()?
        .unwrap_or_default();

    let mut candidates = partition::diff(&input_partitions, &output_partitions, compare_columns);

    if let Some(select) = &config.select_expression {
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let candidate_ctx = ctx.clone().with_object(&candidate.expr_context());
            if eval_condition(select, &candidate_ctx, "select expression", action_id)? {
                kept.push(candidate);
            }
        }
        candidates = kept;
    }

    // Oldest first so a bounded run drains the backlog in order.
    candidates.sort();
    if let Some(max) = config.nb_of_partition_values_per_run {
        candidates.truncate(max.max(1));
    }

    if let Some(fail) = &config.fail_condition {
        for candidate in &candidates {
            let candidate_ctx = ctx.clone().with_object(&candidate.expr_context());
            if eval_condition(fail, &candidate_ctx, "fail condition", action_id)? {
                return Err(OrchestrationError::task_failed(
                    action_id.clone(),
                    anyhow::anyhow!(
                        "fail condition '{fail}' evaluated true for partition values {candidate}"
                    ),
                ));
            }
        }
    }

    if candidates.is_empty() {
        return Err(OrchestrationError::no_data_dont_stop(format!(
            "action '{action_id}': no partitions of '{}' missing in '{}'",
            main_input.id(),
            compare_object.id()
        )));
    }

    tracing::info!(
        action = %action_id,
        selected = %candidates
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
        "Partition-diff selected partitions"
    );
    Ok(Some(ModeResult::partitions(candidates)))
}

fn apply_incremental(
    compare_col: &str,
    action_id: &ActionId,
    main_output: &dyn DataObject,
    main_input_subfeed: &SubFeed,
) -> Result<Option<ModeResult>> {
    let readable_output = main_output.readable().ok_or_else(|| {
        OrchestrationError::Config(format!(
            "action '{action_id}': incremental mode needs a readable main output, '{}' is not",
            main_output.id()
        ))
    })?;
    let existing = readable_output.read(&[])?;
    let high_water_mark = existing.max_str(compare_col);

    let filter = high_water_mark.map(|max| {
        if max.parse::<f64>().is_ok() {
            format!("{compare_col} > {max}")
        } else {
            format!("{compare_col} > '{max}'")
        }
    });
    if let Some(f) = &filter {
        tracing::info!(action = %action_id, filter = %f, "Incremental mode selected filter");
    }
    Ok(Some(ModeResult {
        partition_values: main_input_subfeed.partition_values.clone(),
        filter,
        stream_offset: None,
    }))
}

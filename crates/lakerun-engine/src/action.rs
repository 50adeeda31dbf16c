//! Actions and the per-action kernel.
//!
//! An action is a node in the execution graph: it reads N inputs, writes M
//! outputs, and optionally transforms in between. The kernel drives one
//! action through a phase: convert and project incoming subfeeds, pick the
//! main input, apply the execution mode (init only, cached for exec),
//! filter, transform, write, and emit output subfeeds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::expression::{self, ExpressionContext};
use lakerun_types::{DataFrame, DataObjectId, PartitionValues, SubFeed};

use crate::context::{ActionPipelineContext, ExecutionPhase};
use crate::dataobject::{
    self, CanCreateStreamingFrame, CanRead, CanWrite, DataObject, Transactional,
};
use crate::mode::{ExecutionMode, ModeResult};
use crate::registry::InstanceRegistry;
use crate::transformer::{FrameMap, TransformerChain};

/// Free-form action metadata; `feed` drives CLI selection.
#[derive(Debug, Clone, Default)]
pub struct ActionMetadata {
    pub feed: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// Optional rewrite of the main input's partition values into the output
/// partition space.
pub type PartitionValuesTransform =
    Arc<dyn Fn(&[PartitionValues]) -> Vec<PartitionValues> + Send + Sync>;

/// A node in the execution graph.
pub struct Action {
    pub id: lakerun_types::ActionId,
    pub inputs: Vec<DataObjectId>,
    pub outputs: Vec<DataObjectId>,
    /// Edges used only for state propagation: the action reads an object
    /// it also writes. Never part of topological ordering.
    pub recursive_inputs: Vec<DataObjectId>,
    pub main_input_id: Option<DataObjectId>,
    pub main_output_id: Option<DataObjectId>,
    pub execution_mode: Option<ExecutionMode>,
    /// Overrides skip propagation: true forces execution, false forces a
    /// skip. Unset means "run unless every input is skipped".
    pub execution_condition: Option<String>,
    pub metadata: ActionMetadata,
    pub transformers: TransformerChain,
    /// Inputs whose subfeed filter is not applied when reading.
    pub input_ids_to_ignore_filter: Vec<DataObjectId>,
    /// When false, recursive inputs are not handed to transformers and
    /// output validation only considers non-recursive inputs.
    pub handle_recursive_inputs_as_subfeeds: bool,
    pub partition_values_transform: Option<PartitionValuesTransform>,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("recursive_inputs", &self.recursive_inputs)
            .field("execution_mode", &self.execution_mode)
            .finish_non_exhaustive()
    }
}

/// Result of one kernel run for one action.
#[derive(Debug)]
pub enum KernelOutcome {
    Completed {
        outputs: Vec<SubFeed>,
        metrics: BTreeMap<String, Value>,
        /// Main input subfeed after mode application; persisted so a
        /// recovery attempt replays the same selection.
        selected_main: Option<SubFeed>,
    },
    Skipped {
        outputs: Vec<SubFeed>,
        message: String,
    },
}

impl Action {
    /// Action with the given edges and an identity transformation.
    #[must_use]
    pub fn new(
        id: impl Into<lakerun_types::ActionId>,
        inputs: Vec<DataObjectId>,
        outputs: Vec<DataObjectId>,
    ) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
            recursive_inputs: Vec::new(),
            main_input_id: None,
            main_output_id: None,
            execution_mode: None,
            execution_condition: None,
            metadata: ActionMetadata::default(),
            transformers: TransformerChain::new(),
            input_ids_to_ignore_filter: Vec::new(),
            handle_recursive_inputs_as_subfeeds: true,
            partition_values_transform: None,
        }
    }

    /// One-input one-output copy action.
    #[must_use]
    pub fn copy(
        id: impl Into<lakerun_types::ActionId>,
        input: impl Into<DataObjectId>,
        output: impl Into<DataObjectId>,
    ) -> Self {
        Self::new(id, vec![input.into()], vec![output.into()])
    }

    /// Set the execution mode.
    #[must_use]
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    /// Set the execution condition expression.
    #[must_use]
    pub fn with_execution_condition(mut self, condition: impl Into<String>) -> Self {
        self.execution_condition = Some(condition.into());
        self
    }

    /// Set the transformer chain.
    #[must_use]
    pub fn with_transformers(mut self, transformers: TransformerChain) -> Self {
        self.transformers = transformers;
        self
    }

    /// Set the feed label.
    #[must_use]
    pub fn with_feed(mut self, feed: impl Into<String>) -> Self {
        self.metadata.feed = Some(feed.into());
        self
    }

    /// Rewrite the main input's partition values into the output partition
    /// space before modes and writes see them.
    #[must_use]
    pub fn with_partition_values_transform(mut self, transform: PartitionValuesTransform) -> Self {
        self.partition_values_transform = Some(transform);
        self
    }

    /// The main output: explicit id or the first declared output.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the action declares no outputs.
    pub fn main_output(&self) -> Result<DataObjectId> {
        self.main_output_id
            .clone()
            .or_else(|| self.outputs.first().cloned())
            .ok_or_else(|| {
                OrchestrationError::Config(format!("action '{}' declares no outputs", self.id))
            })
    }

    /// Candidate main inputs: the explicit id, or the inputs ordered by
    /// descending partition-column count.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unresolvable data objects.
    pub fn main_input_candidates(&self, registry: &InstanceRegistry) -> Result<Vec<DataObjectId>> {
        if let Some(explicit) = &self.main_input_id {
            return Ok(vec![explicit.clone()]);
        }
        let mut with_counts: Vec<(usize, DataObjectId)> = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let object = registry.data_object(input)?;
            let count = dataobject::partition_columns_of(object.as_ref()).len();
            with_counts.push((count, input.clone()));
        }
        // Stable: ties keep declaration order.
        with_counts.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(with_counts.into_iter().map(|(_, id)| id).collect())
    }

    fn resolve_main_input(
        &self,
        registry: &InstanceRegistry,
        input_subfeeds: &[SubFeed],
    ) -> Result<DataObjectId> {
        let candidates = self.main_input_candidates(registry)?;
        let first_not_skipped = candidates.iter().find(|id| {
            input_subfeeds
                .iter()
                .any(|s| s.data_object_id == **id && !s.is_skipped)
        });
        first_not_skipped
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| {
                OrchestrationError::Config(format!("action '{}' declares no inputs", self.id))
            })
    }

    /// Check the action's configuration against the registry: references
    /// resolve, required capabilities exist, mode prerequisites hold.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for the first violation found.
    pub fn validate_config(&self, registry: &InstanceRegistry) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(OrchestrationError::Config(format!(
                "action '{}' declares no inputs",
                self.id
            )));
        }
        if self.outputs.is_empty() {
            return Err(OrchestrationError::Config(format!(
                "action '{}' declares no outputs",
                self.id
            )));
        }
        for input in &self.inputs {
            let object = registry.data_object(input)?;
            if object.readable().is_none() && object.streamable().is_none() {
                return Err(OrchestrationError::Config(format!(
                    "action '{}': input '{input}' is not readable",
                    self.id
                )));
            }
        }
        for output in &self.outputs {
            let object = registry.data_object(output)?;
            let Some(writable) = object.writable() else {
                return Err(OrchestrationError::Config(format!(
                    "action '{}': output '{output}' is not writable",
                    self.id
                )));
            };
            if writable.save_mode() == dataobject::SaveMode::Merge && object.mergeable().is_none()
            {
                return Err(OrchestrationError::Config(format!(
                    "action '{}': output '{output}' uses merge save mode but is not mergeable",
                    self.id
                )));
            }
        }
        for recursive in &self.recursive_inputs {
            if !self.outputs.contains(recursive) {
                return Err(OrchestrationError::Config(format!(
                    "action '{}': recursive input '{recursive}' must also be an output",
                    self.id
                )));
            }
        }
        if let Some(main_input) = &self.main_input_id {
            if !self.inputs.contains(main_input) {
                return Err(OrchestrationError::Config(format!(
                    "action '{}': main input '{main_input}' is not among its inputs",
                    self.id
                )));
            }
        }
        if let Some(main_output) = &self.main_output_id {
            if !self.outputs.contains(main_output) {
                return Err(OrchestrationError::Config(format!(
                    "action '{}': main output '{main_output}' is not among its outputs",
                    self.id
                )));
            }
        }
        self.validate_mode_prerequisites(registry)?;
        if !self.handle_recursive_inputs_as_subfeeds && !self.recursive_inputs.is_empty() {
            tracing::warn!(
                action = %self.id,
                "Recursive inputs are not handled as subfeeds; transformers will not see them"
            );
        }
        Ok(())
    }

    fn validate_mode_prerequisites(&self, registry: &InstanceRegistry) -> Result<()> {
        let Some(mode) = &self.execution_mode else {
            return Ok(());
        };
        let candidates = self.main_input_candidates(registry)?;
        let main_input = registry.data_object(&candidates[0])?;
        match mode {
            ExecutionMode::PartitionDiff(config) => {
                if main_input.partitioned().is_none() {
                    return Err(OrchestrationError::Config(format!(
                        "action '{}': partition-diff mode needs a partitioned main input",
                        self.id
                    )));
                }
                if let Some(alternative) = &config.alternative_output_id {
                    let object = registry.data_object(alternative)?;
                    if object.partitioned().is_none() {
                        return Err(OrchestrationError::Config(format!(
                            "action '{}': alternative output '{alternative}' is not partitioned",
                            self.id
                        )));
                    }
                }
            }
            ExecutionMode::StreamingOnce { .. } => {
                if main_input.streamable().is_none() {
                    return Err(OrchestrationError::Config(format!(
                        "action '{}': streaming mode needs a streamable main input",
                        self.id
                    )));
                }
            }
            ExecutionMode::Incremental { .. } => {
                let main_output = registry.data_object(&self.main_output()?)?;
                if main_output.readable().is_none() {
                    return Err(OrchestrationError::Config(format!(
                        "action '{}': incremental mode needs a readable main output",
                        self.id
                    )));
                }
            }
            ExecutionMode::FixedPartitionValues { .. }
            | ExecutionMode::FailIfNoPartitionValues
            | ExecutionMode::ProcessAll
            | ExecutionMode::Custom(_) => {}
        }
        Ok(())
    }

    /// Prepare-phase work: validate configuration and probe the involved
    /// data objects. No data is read.
    ///
    /// # Errors
    ///
    /// Returns configuration or precondition errors.
    pub fn prepare(&self, ctx: &ActionPipelineContext) -> Result<()> {
        self.validate_config(&ctx.registry)?;
        for id in self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .chain(self.recursive_inputs.iter())
        {
            ctx.registry.data_object(id)?.prepare()?;
        }
        Ok(())
    }

    /// Init-phase kernel run: plan without materialising.
    ///
    /// # Errors
    ///
    /// See [`run_kernel`](Self::run_kernel).
    pub fn init(
        &self,
        incoming: &BTreeMap<DataObjectId, SubFeed>,
        ctx: &ActionPipelineContext,
    ) -> Result<KernelOutcome> {
        self.run_kernel(ExecutionPhase::Init, incoming, ctx)
    }

    /// Exec-phase kernel run: materialise and write.
    ///
    /// # Errors
    ///
    /// See [`run_kernel`](Self::run_kernel).
    pub fn exec(
        &self,
        incoming: &BTreeMap<DataObjectId, SubFeed>,
        ctx: &ActionPipelineContext,
    ) -> Result<KernelOutcome> {
        self.run_kernel(ExecutionPhase::Exec, incoming, ctx)
    }

    /// Skipped subfeeds for every declared output (empty partition values,
    /// filter cleared).
    #[must_use]
    pub fn skipped_outputs(&self) -> Vec<SubFeed> {
        self.outputs
            .iter()
            .map(|id| SubFeed::new(id.clone()).as_skipped())
            .collect()
    }

    fn expression_context(
        &self,
        ctx: &ActionPipelineContext,
        input_subfeeds: &[SubFeed],
        main_input_id: &DataObjectId,
        selected: &[PartitionValues],
    ) -> ExpressionContext {
        let mut skipped = serde_json::Map::new();
        for subfeed in input_subfeeds {
            skipped.insert(
                subfeed.data_object_id.to_string(),
                Value::Bool(subfeed.is_skipped),
            );
        }
        let main = input_subfeeds
            .iter()
            .find(|s| s.data_object_id == *main_input_id);
        let selected_json = Value::Array(
            selected
                .iter()
                .map(PartitionValues::expr_context)
                .collect(),
        );
        ctx.expression_context()
            .with(
                "is_dag_start",
                input_subfeeds.iter().any(|s| s.is_dag_start),
            )
            .with("is_skipped", Value::Object(skipped))
            .with(
                "input_partition_values",
                main.map_or(Value::Array(Vec::new()), SubFeed::partition_values_json),
            )
            .with("output_partition_values", selected_json.clone())
            .with("selected_partition_values", selected_json)
    }

    /// Promote infrastructure errors to action-scoped task failures; the
    /// taxonomy's other kinds keep their classification.
    fn classify(&self, err: OrchestrationError) -> OrchestrationError {
        match err {
            OrchestrationError::Infrastructure(source) => {
                OrchestrationError::task_failed(self.id.clone(), source)
            }
            other => other,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_kernel(
        &self,
        phase: ExecutionPhase,
        incoming: &BTreeMap<DataObjectId, SubFeed>,
        ctx: &ActionPipelineContext,
    ) -> Result<KernelOutcome> {
        let registry = &ctx.registry;

        // 1. Convert incoming subfeeds and project partition values onto
        //    each input's partition columns.
        let mut input_subfeeds: Vec<SubFeed> = Vec::with_capacity(self.inputs.len());
        for input_id in &self.inputs {
            let subfeed = incoming
                .get(input_id)
                .cloned()
                .unwrap_or_else(|| SubFeed::new(input_id.clone()));
            let object = registry.data_object(input_id)?;
            let columns = dataobject::partition_columns_of(object.as_ref());
            input_subfeeds.push(subfeed.project(&columns));
        }

        // 2. Main input and output.
        let main_input_id = self.resolve_main_input(registry, &input_subfeeds)?;
        let main_output_id = self.main_output()?;

        // 3. Skip determination (monotone join over inputs, overridable by
        //    the execution condition).
        let all_skipped = input_subfeeds.iter().all(|s| s.is_skipped);
        let main_subfeed = input_subfeeds
            .iter()
            .find(|s| s.data_object_id == main_input_id)
            .cloned()
            .unwrap_or_else(|| SubFeed::new(main_input_id.clone()));
        let base_ctx = self.expression_context(
            ctx,
            &input_subfeeds,
            &main_input_id,
            &main_subfeed.partition_values,
        );
        if let Some(condition) = &self.execution_condition {
            let run = expression::evaluate_bool(condition, &base_ctx).map_err(|e| {
                OrchestrationError::Config(format!(
                    "action '{}': execution condition '{condition}': {e}",
                    self.id
                ))
            })?;
            if !run {
                return Ok(KernelOutcome::Skipped {
                    outputs: self.skipped_outputs(),
                    message: format!("execution condition '{condition}' evaluated false"),
                });
            }
        } else if all_skipped {
            return Ok(KernelOutcome::Skipped {
                outputs: self.skipped_outputs(),
                message: "all inputs skipped".to_string(),
            });
        }

        // 4. Initial selection from the main input's partitions.
        let mut main_subfeed = main_subfeed;
        let mut selected: Vec<PartitionValues> = main_subfeed.partition_values.clone();
        if let Some(transform) = &self.partition_values_transform {
            selected = transform(&selected);
        }

        // 5. Execution mode: computed in init, cached for exec (or
        //    replayed verbatim from a previous attempt).
        let mut mode_result: Option<ModeResult> = None;
        if let Some(mode) = &self.execution_mode {
            let cached = ctx.cached_mode_result(&self.id)?;
            let applied = match cached {
                Some(replayed) => replayed,
                None => {
                    let main_input = registry.data_object(&main_input_id)?;
                    let main_output = registry.data_object(&main_output_id)?;
                    let alternative = match mode {
                        ExecutionMode::PartitionDiff(config) => config
                            .alternative_output_id
                            .as_ref()
                            .map(|id| registry.data_object(id))
                            .transpose()?,
                        _ => None,
                    };
                    let result = mode.apply(
                        &self.id,
                        main_input.as_ref(),
                        main_output.as_ref(),
                        alternative.as_deref(),
                        &main_subfeed,
                        &base_ctx,
                    );
                    match result {
                        Ok(applied) => {
                            ctx.cache_mode_result(&self.id, applied.clone())?;
                            applied
                        }
                        Err(OrchestrationError::NoDataToProcess {
                            message,
                            stop: false,
                        }) => {
                            tracing::info!(action = %self.id, %message, "No data to process, skipping");
                            return Ok(KernelOutcome::Skipped {
                                outputs: self.skipped_outputs(),
                                message,
                            });
                        }
                        Err(other) => return Err(other),
                    }
                }
            };
            if let Some(result) = applied {
                main_subfeed = main_subfeed
                    .with_selection(result.partition_values.clone(), result.filter.clone());
                selected = result.partition_values.clone();
                mode_result = Some(result);
            }
        }

        // 6. Materialise input frames, applying subfeed filters.
        let stream_budget = self
            .execution_mode
            .as_ref()
            .and_then(ExecutionMode::stream_max_batches);
        let mut frames = FrameMap::new();
        for subfeed in &input_subfeeds {
            let effective = if subfeed.data_object_id == main_input_id {
                &main_subfeed
            } else {
                subfeed
            };
            let frame = self
                .materialise(effective, &main_input_id, stream_budget, ctx)
                .map_err(|e| self.classify(e))?;
            frames.insert(effective.data_object_id.to_string(), frame);
        }
        if self.handle_recursive_inputs_as_subfeeds {
            for recursive in &self.recursive_inputs {
                let subfeed = SubFeed::new(recursive.clone());
                let frame = self
                    .materialise(&subfeed, &main_input_id, None, ctx)
                    .map_err(|e| self.classify(e))?;
                frames.insert(recursive.to_string(), frame);
            }
        }

        // 7. Transform and reconcile output names. User functions only run
        //    during exec; init validates the declarative parts.
        let expr_ctx = self.expression_context(ctx, &input_subfeeds, &main_input_id, &selected);
        let transformed = self
            .transformers
            .apply_phase(frames, &expr_ctx, phase == ExecutionPhase::Exec)
            .map_err(|e| self.classify(e))?;
        let mut by_output =
            self.reconcile_outputs(transformed, phase == ExecutionPhase::Exec)?;

        // 8. Write (exec only), collect metrics, emit output subfeeds. A
        //    recursive output kept out of the subfeed flow may have no
        //    frame here; it is left unwritten.
        let mut outputs = Vec::with_capacity(self.outputs.len());
        let mut metrics: BTreeMap<String, Value> = BTreeMap::new();
        for output_id in &self.outputs {
            let frame = by_output.remove(output_id.as_str());
            let object = registry.data_object(output_id)?;
            let out_columns = dataobject::partition_columns_of(object.as_ref());
            let mut out_partition_values: Vec<PartitionValues> = Vec::new();
            for pv in &selected {
                let projected = pv.project(&out_columns);
                if !projected.is_empty() && !out_partition_values.contains(&projected) {
                    out_partition_values.push(projected);
                }
            }

            if phase == ExecutionPhase::Exec {
                if let Some(frame) = &frame {
                    let rows = self
                        .write_output(object.as_ref(), frame, &out_partition_values)
                        .map_err(|e| self.classify(e))?;
                    metrics.insert(format!("{output_id}.rows_written"), rows.into());
                    tracing::info!(
                        action = %self.id,
                        output = %output_id,
                        rows_written = rows,
                        partition_values = %out_partition_values
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(","),
                        "Wrote output"
                    );
                } else {
                    tracing::debug!(
                        action = %self.id,
                        output = %output_id,
                        "No transformed subfeed for recursive output, leaving it unwritten"
                    );
                }
            }

            outputs.push(SubFeed {
                data_object_id: output_id.clone(),
                partition_values: out_partition_values,
                is_dag_start: false,
                is_skipped: false,
                filter: None,
                payload: frame,
            });
        }

        if phase == ExecutionPhase::Exec {
            if let Some(mode) = &self.execution_mode {
                mode.post_exec(&self.id, ctx.stream_offset(&self.id)?)?;
            }
        }

        let selected_main = mode_result.is_some().then(|| main_subfeed.clone());
        Ok(KernelOutcome::Completed {
            outputs,
            metrics,
            selected_main,
        })
    }

    /// Produce the frame for one input subfeed: reuse the payload, run the
    /// streaming read for a streaming main input, or read from the data
    /// object; then apply the subfeed filter unless suppressed.
    fn materialise(
        &self,
        subfeed: &SubFeed,
        main_input_id: &DataObjectId,
        stream_budget: Option<usize>,
        ctx: &ActionPipelineContext,
    ) -> Result<DataFrame> {
        if subfeed.is_skipped {
            return Ok(DataFrame::default());
        }
        let object = ctx.registry.data_object(&subfeed.data_object_id)?;
        let frame = if let Some(payload) = &subfeed.payload {
            payload.clone()
        } else if subfeed.data_object_id == *main_input_id && stream_budget.is_some() {
            let streamable = object.streamable().ok_or_else(|| {
                OrchestrationError::Config(format!(
                    "action '{}': input '{}' is not streamable",
                    self.id, subfeed.data_object_id
                ))
            })?;
            let offset = ctx
                .cached_mode_result(&self.id)?
                .flatten()
                .and_then(|r| r.stream_offset)
                .unwrap_or(0);
            let (frame, next) =
                streamable.read_stream(offset, stream_budget.unwrap_or(1))?;
            ctx.record_stream_offset(&self.id, next)?;
            frame
        } else {
            let readable = object.readable().ok_or_else(|| {
                OrchestrationError::Config(format!(
                    "action '{}': input '{}' is not readable",
                    self.id, subfeed.data_object_id
                ))
            })?;
            readable.read(&subfeed.partition_values)?
        };

        let ignore = self
            .input_ids_to_ignore_filter
            .contains(&subfeed.data_object_id);
        match (&subfeed.filter, ignore) {
            (Some(filter), false) => frame.filter_expr(filter).map_err(|e| {
                OrchestrationError::Config(format!(
                    "action '{}': filter '{filter}' on '{}': {e}",
                    self.id, subfeed.data_object_id
                ))
            }),
            _ => Ok(frame),
        }
    }

    /// Match transformed frames against declared outputs. A single
    /// unmatched frame is renamed onto a single unmatched output (the
    /// copy-action case); anything else must name outputs explicitly.
    /// Recursive inputs kept out of the subfeed flow are exempt from this
    /// validation: the transformation manages those objects itself, so the
    /// chain need not (but may) produce a frame for them, and frames it
    /// passes through untouched are dropped rather than rejected.
    /// Outside strict mode (init, where user functions did not run and
    /// frame names may not be final) unmatched outputs are filled from the
    /// surplus pool in order, then left empty.
    fn reconcile_outputs(&self, transformed: FrameMap, strict: bool) -> Result<FrameMap> {
        let exempt: Vec<String> = if self.handle_recursive_inputs_as_subfeeds {
            Vec::new()
        } else {
            self.recursive_inputs.iter().map(ToString::to_string).collect()
        };
        let expected: Vec<String> = self
            .outputs
            .iter()
            .map(ToString::to_string)
            .filter(|output| !exempt.contains(output))
            .collect();
        let got: Vec<String> = transformed.keys().cloned().collect();
        let missing: Vec<String> = expected
            .iter()
            .filter(|e| !got.contains(e))
            .cloned()
            .collect();
        let mut surplus: Vec<String> = got
            .iter()
            .filter(|g| !expected.contains(g) && !exempt.contains(g))
            .cloned()
            .collect();

        if missing.is_empty() && surplus.is_empty() {
            return Ok(transformed);
        }
        if missing.len() == 1 && surplus.len() == 1 {
            let mut renamed = transformed;
            let frame = renamed.remove(surplus[0].as_str()).unwrap_or_default();
            renamed.insert(missing[0].clone(), frame);
            return Ok(renamed);
        }
        if missing.is_empty() && !exempt.is_empty() {
            // Input frames the chain passed through untouched.
            let mut retained = transformed;
            retained.retain(|name, _| !surplus.contains(name));
            return Ok(retained);
        }
        if strict {
            return Err(OrchestrationError::Config(format!(
                "action '{}': transformed subfeeds [{}] do not match declared outputs [{}]",
                self.id,
                got.join(","),
                expected.join(","),
            )));
        }
        let mut lenient = transformed;
        for output in missing {
            let frame = if surplus.is_empty() {
                DataFrame::default()
            } else {
                lenient.remove(&surplus.remove(0)).unwrap_or_default()
            };
            lenient.insert(output, frame);
        }
        Ok(lenient)
    }

    fn write_output(
        &self,
        object: &dyn DataObject,
        frame: &DataFrame,
        partition_values: &[PartitionValues],
    ) -> Result<u64> {
        let writable = object.writable().ok_or_else(|| {
            OrchestrationError::Config(format!(
                "action '{}': output '{}' is not writable",
                self.id,
                object.id()
            ))
        })?;
        if let Some(tx) = object.transactional() {
            tx.begin()?;
            match writable.write(frame, partition_values) {
                Ok(rows) => {
                    tx.commit()?;
                    Ok(rows)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback() {
                        tracing::warn!(
                            action = %self.id,
                            output = %object.id(),
                            error = %rollback_err,
                            "Rollback failed after write error"
                        );
                    }
                    Err(err)
                }
            }
        } else {
            writable.write(frame, partition_values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataobject::{CanRead, MemoryTableDataObject, SaveMode};
    use crate::mode::PartitionDiffConfig;
    use crate::transformer::Transformer;
    use lakerun_types::state::ExecutionId;
    use serde_json::json;

    fn registry() -> InstanceRegistry {
        let mut registry = InstanceRegistry::new();
        registry
            .register_data_object(Arc::new(
                MemoryTableDataObject::new("src")
                    .with_partition_columns(["dt", "type"])
                    .with_rows(vec![
                        json!({"dt": "20180101", "type": "person", "rating": 5}),
                        json!({"dt": "20190101", "type": "company", "rating": 10}),
                    ]),
            ))
            .unwrap();
        registry
            .register_data_object(Arc::new(
                MemoryTableDataObject::new("tgt").with_partition_columns(["dt"]),
            ))
            .unwrap();
        registry
    }

    fn context(registry: InstanceRegistry) -> ActionPipelineContext {
        ActionPipelineContext::new("app", ".*", ExecutionId::initial(), Arc::new(registry))
    }

    fn dag_start(partition_values: Vec<PartitionValues>) -> BTreeMap<DataObjectId, SubFeed> {
        let mut map = BTreeMap::new();
        map.insert(
            DataObjectId::new("src"),
            SubFeed::dag_start("src".into(), partition_values),
        );
        map
    }

    fn table(ctx: &ActionPipelineContext, id: &str) -> Arc<dyn DataObject> {
        ctx.registry.data_object(&id.into()).unwrap()
    }

    #[test]
    fn copy_action_exec_writes_all_rows() {
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt");
        let outcome = action.exec(&dag_start(Vec::new()), &ctx).unwrap();
        let KernelOutcome::Completed {
            outputs, metrics, ..
        } = outcome
        else {
            panic!("expected completion");
        };
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].data_object_id, DataObjectId::new("tgt"));
        assert_eq!(metrics["tgt.rows_written"], 2);
        let tgt = table(&ctx, "tgt");
        assert_eq!(tgt.readable().unwrap().read(&[]).unwrap().num_rows(), 2);
    }

    #[test]
    fn partition_values_restrict_the_copy() {
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt");
        let outcome = action
            .exec(
                &dag_start(vec![PartitionValues::single("dt", "20180101")]),
                &ctx,
            )
            .unwrap();
        let KernelOutcome::Completed { outputs, .. } = outcome else {
            panic!("expected completion");
        };
        // Output partition values are projected onto tgt's columns.
        assert_eq!(
            outputs[0].partition_values,
            vec![PartitionValues::single("dt", "20180101")]
        );
        let tgt = table(&ctx, "tgt");
        let rows = tgt.readable().unwrap().read(&[]).unwrap();
        assert_eq!(rows.num_rows(), 1);
        assert_eq!(rows.rows()[0]["rating"], 5);
    }

    #[test]
    fn init_plans_without_writing() {
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt");
        let outcome = action.init(&dag_start(Vec::new()), &ctx).unwrap();
        let KernelOutcome::Completed { outputs, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(outputs[0].payload.as_ref().unwrap().num_rows(), 2);
        let tgt = table(&ctx, "tgt");
        assert!(tgt.readable().unwrap().read(&[]).unwrap().is_empty());
    }

    #[test]
    fn skipped_inputs_propagate_to_outputs() {
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt");
        let mut incoming = BTreeMap::new();
        incoming.insert(
            DataObjectId::new("src"),
            SubFeed::new("src".into()).as_skipped(),
        );
        let outcome = action.exec(&incoming, &ctx).unwrap();
        let KernelOutcome::Skipped { outputs, .. } = outcome else {
            panic!("expected skip");
        };
        assert!(outputs[0].is_skipped);
        assert!(outputs[0].partition_values.is_empty());
        assert!(outputs[0].filter.is_none());
    }

    #[test]
    fn execution_condition_true_overrides_skip() {
        let ctx = context(registry());
        let action =
            Action::copy("a", "src", "tgt").with_execution_condition("run_id == 1");
        let mut incoming = BTreeMap::new();
        incoming.insert(
            DataObjectId::new("src"),
            SubFeed::new("src".into()).as_skipped(),
        );
        let outcome = action.exec(&incoming, &ctx).unwrap();
        assert!(matches!(outcome, KernelOutcome::Completed { .. }));
    }

    #[test]
    fn execution_condition_false_skips() {
        let ctx = context(registry());
        let action =
            Action::copy("a", "src", "tgt").with_execution_condition("run_id > 99");
        let outcome = action.exec(&dag_start(Vec::new()), &ctx).unwrap();
        assert!(matches!(outcome, KernelOutcome::Skipped { .. }));
    }

    #[test]
    fn transformer_failure_is_task_failed() {
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt").with_transformers(
            TransformerChain::new().with(Transformer::OneToOne {
                subfeed_name: None,
                func: Arc::new(|_, _| anyhow::bail!("boom")),
            }),
        );
        let err = action.exec(&dag_start(Vec::new()), &ctx).unwrap_err();
        assert!(matches!(err, OrchestrationError::TaskFailed { .. }));
    }

    #[test]
    fn filter_transformer_reaches_output(){
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt").with_transformers(
            TransformerChain::new().with(Transformer::Filter {
                subfeed_name: None,
                predicate: "rating > 6".to_string(),
            }),
        );
        action.exec(&dag_start(Vec::new()), &ctx).unwrap();
        let tgt = table(&ctx, "tgt");
        let rows = tgt.readable().unwrap().read(&[]).unwrap();
        assert_eq!(rows.num_rows(), 1);
        assert_eq!(rows.rows()[0]["rating"], 10);
    }

    #[test]
    fn subfeed_filter_is_applied_on_read() {
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt");
        let mut incoming = BTreeMap::new();
        incoming.insert(
            DataObjectId::new("src"),
            SubFeed {
                data_object_id: "src".into(),
                filter: Some("rating > 6".to_string()),
                ..SubFeed::default()
            },
        );
        action.exec(&incoming, &ctx).unwrap();
        let tgt = table(&ctx, "tgt");
        assert_eq!(tgt.readable().unwrap().read(&[]).unwrap().num_rows(), 1);
    }

    #[test]
    fn ignored_filter_is_not_applied() {
        let ctx = context(registry());
        let mut action = Action::copy("a", "src", "tgt");
        action.input_ids_to_ignore_filter = vec!["src".into()];
        let mut incoming = BTreeMap::new();
        incoming.insert(
            DataObjectId::new("src"),
            SubFeed {
                data_object_id: "src".into(),
                filter: Some("rating > 6".to_string()),
                ..SubFeed::default()
            },
        );
        action.exec(&incoming, &ctx).unwrap();
        let tgt = table(&ctx, "tgt");
        assert_eq!(tgt.readable().unwrap().read(&[]).unwrap().num_rows(), 2);
    }

    #[test]
    fn mode_result_is_cached_between_init_and_exec() {
        let ctx = context(registry());
        let action = Action::copy("a", "src", "tgt").with_execution_mode(
            ExecutionMode::PartitionDiff(PartitionDiffConfig {
                partition_col_nb: Some(1),
                ..PartitionDiffConfig::default()
            }),
        );
        action.init(&dag_start(Vec::new()), &ctx).unwrap();
        let cached = ctx
            .cached_mode_result(&action.id)
            .unwrap()
            .flatten()
            .expect("mode result cached");
        assert_eq!(cached.partition_values.len(), 2);

        // Exec replays the cached selection.
        let outcome = action.exec(&dag_start(Vec::new()), &ctx).unwrap();
        let KernelOutcome::Completed { selected_main, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(
            selected_main.unwrap().partition_values.len(),
            2
        );
    }

    #[test]
    fn main_input_prefers_most_partitioned() {
        let mut reg = registry();
        reg.register_data_object(Arc::new(MemoryTableDataObject::new("lookup")))
            .unwrap();
        let ctx = context(reg);
        let action = Action::new(
            "a",
            vec!["lookup".into(), "src".into()],
            vec!["tgt".into()],
        );
        let candidates = action.main_input_candidates(&ctx.registry).unwrap();
        assert_eq!(candidates[0], DataObjectId::new("src"));
    }

    #[test]
    fn main_input_skips_skipped_candidates() {
        let mut reg = registry();
        reg.register_data_object(Arc::new(MemoryTableDataObject::new("lookup")))
            .unwrap();
        let ctx = context(reg);
        let action = Action::new(
            "a",
            vec!["lookup".into(), "src".into()],
            vec!["tgt".into()],
        );
        let subfeeds = vec![
            SubFeed::new("src".into()).as_skipped(),
            SubFeed::new("lookup".into()),
        ];
        let main = action.resolve_main_input(&ctx.registry, &subfeeds).unwrap();
        assert_eq!(main, DataObjectId::new("lookup"));
    }

    #[test]
    fn validate_config_rejects_merge_without_primary_key() {
        let mut reg = InstanceRegistry::new();
        reg.register_data_object(Arc::new(MemoryTableDataObject::new("src")))
            .unwrap();
        reg.register_data_object(Arc::new(
            MemoryTableDataObject::new("tgt").with_save_mode(SaveMode::Merge),
        ))
        .unwrap();
        let action = Action::copy("a", "src", "tgt");
        let err = action.validate_config(&reg).unwrap_err();
        assert!(err.to_string().contains("not mergeable"));
    }

    #[test]
    fn validate_config_rejects_recursive_input_that_is_not_output() {
        let reg = registry();
        let mut action = Action::copy("a", "src", "tgt");
        action.recursive_inputs = vec!["src".into()];
        let err = action.validate_config(&reg).unwrap_err();
        assert!(err.to_string().contains("recursive input"));
    }

    #[test]
    fn recursive_input_sees_previous_content() {
        let mut reg = registry();
        reg.register_data_object(Arc::new(MemoryTableDataObject::new("acc")))
            .unwrap();
        let ctx = context(reg);
        // Seed the accumulator through a first run.
        let mut action = Action::copy("a", "src", "acc");
        action.recursive_inputs = vec!["acc".into()];
        // A many-to-many transformer unioning the previous state.
        action.transformers =
            TransformerChain::new().with(Transformer::ManyToMany {
                func: Arc::new(|mut frames, _| {
                    let src = frames.remove("src").unwrap_or_default();
                    let acc = frames.remove("acc").unwrap_or_default();
                    let mut out = FrameMap::new();
                    out.insert("acc".to_string(), acc.union(&src));
                    Ok(out)
                }),
            });

        action.exec(&dag_start(Vec::new()), &ctx).unwrap();
        let first = table(&ctx, "acc")
            .readable()
            .unwrap()
            .read(&[])
            .unwrap()
            .num_rows();
        assert_eq!(first, 2);

        action.exec(&dag_start(Vec::new()), &ctx).unwrap();
        let second = table(&ctx, "acc")
            .readable()
            .unwrap()
            .read(&[])
            .unwrap()
            .num_rows();
        // Previous content unioned with the source again.
        assert_eq!(second, 6);
    }

    #[test]
    fn partition_values_transform_rewrites_output_selection() {
        let ctx = context(registry());
        // Input days land in a fixed output snapshot partition.
        let action = Action::copy("a", "src", "tgt").with_partition_values_transform(Arc::new(
            |_values: &[PartitionValues]| vec![PartitionValues::single("dt", "snapshot")],
        ));
        let outcome = action
            .exec(
                &dag_start(vec![PartitionValues::single("dt", "20180101")]),
                &ctx,
            )
            .unwrap();
        let KernelOutcome::Completed { outputs, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(
            outputs[0].partition_values,
            vec![PartitionValues::single("dt", "snapshot")]
        );
        // The read still honored the incoming selection.
        assert_eq!(outputs[0].payload.as_ref().unwrap().num_rows(), 1);
    }

    #[test]
    fn recursive_output_outside_subfeeds_is_left_unwritten() {
        let mut reg = registry();
        reg.register_data_object(Arc::new(MemoryTableDataObject::new("acc")))
            .unwrap();
        let ctx = context(reg);
        let mut action = Action::new("a", vec!["src".into()], vec!["tgt".into(), "acc".into()]);
        action.recursive_inputs = vec!["acc".into()];
        action.handle_recursive_inputs_as_subfeeds = false;

        let outcome = action.exec(&dag_start(Vec::new()), &ctx).unwrap();
        let KernelOutcome::Completed {
            outputs, metrics, ..
        } = outcome
        else {
            panic!("expected completion");
        };
        // The chain's single frame landed on the non-recursive output;
        // the recursive output was neither validated nor written.
        assert_eq!(
            table(&ctx, "tgt").readable().unwrap().read(&[]).unwrap().num_rows(),
            2
        );
        assert!(table(&ctx, "acc").readable().unwrap().read(&[]).unwrap().is_empty());
        assert!(metrics.contains_key("tgt.rows_written"));
        assert!(!metrics.contains_key("acc.rows_written"));
        let acc_out = outputs
            .iter()
            .find(|s| s.data_object_id == DataObjectId::new("acc"))
            .unwrap();
        assert!(acc_out.payload.is_none());
    }

    #[test]
    fn unmatched_multi_output_transform_is_config_error() {
        let mut reg = registry();
        reg.register_data_object(Arc::new(MemoryTableDataObject::new("tgt2")))
            .unwrap();
        let ctx = context(reg);
        let action = Action::new(
            "a",
            vec!["src".into()],
            vec!["tgt".into(), "tgt2".into()],
        );
        let err = action.exec(&dag_start(Vec::new()), &ctx).unwrap_err();
        assert!(matches!(err, OrchestrationError::Config(_)));
    }
}

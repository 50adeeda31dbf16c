//! Driver loop.
//!
//! Selects actions by feed, computes the execution id against the state
//! store (recovering a failed attempt when one exists), seeds the
//! DAG-start subfeeds from the driver's partition filter, invokes the
//! scheduler, and surfaces the exit status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use lakerun_state::{FileStateStore, RetentionPolicy, StateStore};
use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::state::{ActionRunState, ExecutionId, RunState};
use lakerun_types::{DataObjectId, PartitionValues, SubFeed};

use crate::context::{ActionPipelineContext, ExecutionPhase};
use crate::mode::{ExecutionMode, ModeResult};
use crate::registry::InstanceRegistry;
use crate::scheduler::{DagScheduler, RunOutcome, SchedulerOptions};

/// Partial-run test modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Stop after prepare: configuration and connectivity validation.
    Config,
    /// Stop after init: everything short of writing.
    DryRun,
}

/// Driver options, typically populated from the CLI.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub app_name: String,
    pub feed_sel: String,
    /// Partition filter for DAG-start subfeeds.
    pub partition_values: Vec<PartitionValues>,
    pub parallelism: usize,
    pub fail_fast: bool,
    /// Root directory of the state store; recovery is enabled when set.
    pub state_path: Option<PathBuf>,
    pub state_retention: RetentionPolicy,
    pub test_mode: Option<TestMode>,
    pub action_timeout: Option<Duration>,
    /// Digest of the frozen configuration, recorded in the state file.
    pub config_digest: Option<String>,
}

impl AppOptions {
    /// Options selecting `feed_sel` under application `app_name`, with
    /// defaults matching the CLI's.
    #[must_use]
    pub fn new(app_name: impl Into<String>, feed_sel: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            feed_sel: feed_sel.into(),
            partition_values: Vec::new(),
            parallelism: 1,
            fail_fast: true,
            state_path: None,
            state_retention: RetentionPolicy::default(),
            test_mode: None,
            action_timeout: None,
            config_digest: None,
        }
    }
}

/// Result of one driver invocation.
#[derive(Debug)]
pub struct RunSummary {
    pub execution_id: ExecutionId,
    pub state: RunState,
    pub first_error: Option<OrchestrationError>,
    pub stopped_early: bool,
}

impl RunSummary {
    /// Process exit code: 0 success (including no-data), 1 configuration
    /// error, 2 execution failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.first_error
            .as_ref()
            .map_or(0, OrchestrationError::exit_code)
    }
}

/// What a recovery attempt carries over from the previous one.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// States of previously succeeded actions, kept verbatim.
    pub completed: BTreeMap<lakerun_types::ActionId, lakerun_types::state::ActionState>,
    /// Subfeeds replayed as inputs to downstream actions.
    pub replayed_subfeeds: Vec<SubFeed>,
    /// Mode selections replayed verbatim for actions that did not
    /// succeed.
    pub replayed_selections: BTreeMap<lakerun_types::ActionId, ModeResult>,
}

/// Decide how a new invocation relates to the previous attempt: a failed
/// attempt is resumed (`attempt_id + 1` plus a [`RecoveryPlan`]); a
/// fully-succeeded one starts a fresh run (`run_id + 1`) with nothing to
/// replay — recovering a succeeded state re-executes no action.
#[must_use]
pub fn plan_execution(previous: Option<&RunState>) -> (ExecutionId, Option<RecoveryPlan>) {
    match previous {
        None => (ExecutionId::initial(), None),
        Some(prev) if prev.has_failures() => {
            let mut plan = RecoveryPlan::default();
            for (id, action_state) in &prev.actions {
                if action_state.state == ActionRunState::Succeeded {
                    plan.completed.insert(id.clone(), action_state.clone());
                    for record in &action_state.results {
                        plan.replayed_subfeeds.push(record.to_subfeed());
                    }
                } else if let Some(selected) = action_state.selected_inputs.first() {
                    plan.replayed_selections.insert(
                        id.clone(),
                        ModeResult {
                            partition_values: selected.partition_values.clone(),
                            filter: selected.filter.clone(),
                            stream_offset: None,
                        },
                    );
                }
            }
            (prev.execution_id().next_attempt(), Some(plan))
        }
        Some(prev) => (prev.execution_id().next_run(), None),
    }
}

/// Run the application: select, validate, schedule, persist, report.
///
/// # Errors
///
/// Returns an error for problems detected before scheduling starts (bad
/// feed selector, invalid configuration, unreadable state store). Failures
/// during the run are reported through [`RunSummary::first_error`].
pub async fn run_application(
    registry: Arc<InstanceRegistry>,
    options: AppOptions,
) -> Result<RunSummary> {
    let actions = registry.select_actions(&options.feed_sel)?;
    if actions.is_empty() {
        return Err(OrchestrationError::Config(format!(
            "no actions match feed selector '{}'",
            options.feed_sel
        )));
    }
    tracing::info!(
        app = options.app_name,
        feed_sel = options.feed_sel,
        actions = actions.len(),
        "Selected actions"
    );
    registry.validate(&actions)?;
    let dag = registry.build_dag(&actions)?;

    // State store and recovery.
    let store: Option<Arc<dyn StateStore>> = match (&options.state_path, options.test_mode) {
        (Some(path), None) => Some(Arc::new(
            FileStateStore::new(path.clone()).with_retention(options.state_retention.clone()),
        )),
        _ => None,
    };
    let previous = match &store {
        Some(store) => {
            let latest = store
                .get_latest(&options.app_name)
                .map_err(|e| OrchestrationError::Infrastructure(e.into()))?;
            match latest {
                Some(file_ref) => Some(
                    store
                        .recover(&file_ref.path)
                        .map_err(|e| OrchestrationError::Infrastructure(e.into()))?,
                ),
                None => None,
            }
        }
        None => None,
    };
    let (execution_id, recovery) = plan_execution(previous.as_ref());
    if let Some(prev) = &previous {
        tracing::info!(
            previous_run = prev.run_id,
            previous_attempt = prev.attempt_id,
            run_id = execution_id.run_id,
            attempt_id = execution_id.attempt_id,
            recovering = recovery.is_some(),
            "Resolved execution id from state store"
        );
    }

    let mut run_state = RunState::new(
        options.app_name.clone(),
        execution_id,
        Utc::now(),
        actions.iter().map(|a| a.id.clone()),
    );
    run_state.config_digest = options.config_digest.clone();

    // Seed DAG-start subfeeds from the driver's partition filter.
    let mut initial_subfeeds: BTreeMap<DataObjectId, SubFeed> = BTreeMap::new();
    for object_id in registry.dag_start_objects(&actions) {
        initial_subfeeds.insert(
            object_id.clone(),
            SubFeed::dag_start(object_id, options.partition_values.clone()),
        );
    }

    let ctx = Arc::new(ActionPipelineContext::new(
        options.app_name.clone(),
        options.feed_sel.clone(),
        execution_id,
        registry.clone(),
    ));

    if let Some(plan) = recovery {
        for (id, action_state) in plan.completed {
            if let Some(slot) = run_state.actions.get_mut(&id) {
                *slot = action_state;
            }
        }
        for subfeed in plan.replayed_subfeeds {
            initial_subfeeds.insert(subfeed.data_object_id.clone(), subfeed);
        }
        for (id, selection) in plan.replayed_selections {
            // Streaming offsets live in the mode's own checkpoint; the
            // mode reapplies instead of replaying a stale offset.
            let is_streaming = actions.iter().any(|a| {
                a.id == id
                    && matches!(
                        a.execution_mode,
                        Some(ExecutionMode::StreamingOnce { .. })
                    )
            });
            if !is_streaming {
                ctx.cache_mode_result(&id, Some(selection))?;
            }
        }
    }

    let scheduler = DagScheduler::new(
        actions,
        dag,
        SchedulerOptions {
            parallelism: options.parallelism.max(1),
            fail_fast: options.fail_fast,
            action_timeout: options.action_timeout,
        },
    );
    let stop_after = options.test_mode.map(|mode| match mode {
        TestMode::Config => ExecutionPhase::Prepare,
        TestMode::DryRun => ExecutionPhase::Init,
    });

    let RunOutcome {
        state,
        first_error,
        stopped_early,
    } = scheduler
        .run(ctx, initial_subfeeds, run_state, store, stop_after)
        .await;

    match &first_error {
        Some(err) => tracing::error!(
            app = options.app_name,
            run_id = execution_id.run_id,
            attempt_id = execution_id.attempt_id,
            category = err.category(),
            error = %err,
            "Run failed"
        ),
        None => tracing::info!(
            app = options.app_name,
            run_id = execution_id.run_id,
            attempt_id = execution_id.attempt_id,
            stopped_early,
            "Run completed"
        ),
    }

    Ok(RunSummary {
        execution_id,
        state,
        first_error,
        stopped_early,
    })
}

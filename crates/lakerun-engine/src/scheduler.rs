//! Three-phase DAG scheduler.
//!
//! Executes the selected actions in three strictly ordered phases
//! (prepare, init, exec); each phase is a full dependency-driven traversal
//! in topological order. Ready actions are dispatched concurrently up to
//! the configured parallelism; phase boundaries are global barriers. The
//! scheduler is the only component that mutates action state, and during
//! exec it persists the run state after every action-state change.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use lakerun_state::StateStore;
use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::state::{ActionRunState, RunState};
use lakerun_types::subfeed::SubFeedRecord;
use lakerun_types::{ActionId, DataObjectId, SubFeed};

use crate::action::{Action, KernelOutcome};
use crate::connection::Connection;
use crate::context::{ActionPipelineContext, ExecutionPhase};
use crate::dag::ActionDag;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum number of actions running concurrently.
    pub parallelism: usize,
    /// Abort the whole run on the first fatal failure (true) or keep
    /// executing independent branches (false).
    pub fail_fast: bool,
    /// Per-action wall-clock budget; exceeding it is a fatal failure.
    pub action_timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            fail_fast: true,
            action_timeout: None,
        }
    }
}

/// Result of one full scheduler run.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub first_error: Option<OrchestrationError>,
    /// True when a no-data-stop condition ended the run early (still a
    /// successful run).
    pub stopped_early: bool,
}

enum ActionResult {
    Completed {
        outputs: Vec<SubFeed>,
        metrics: BTreeMap<String, serde_json::Value>,
        selected_main: Option<SubFeed>,
    },
    Skipped {
        outputs: Vec<SubFeed>,
        message: String,
    },
}

struct PhaseResult {
    first_error: Option<OrchestrationError>,
    stopped_early: bool,
}

/// Scheduler over a validated action set.
pub struct DagScheduler {
    actions: Vec<Arc<Action>>,
    dag: ActionDag,
    options: SchedulerOptions,
}

impl DagScheduler {
    /// Scheduler for `actions` with their dependency graph.
    #[must_use]
    pub fn new(actions: Vec<Arc<Action>>, dag: ActionDag, options: SchedulerOptions) -> Self {
        Self {
            actions,
            dag,
            options,
        }
    }

    fn action(&self, id: &ActionId) -> Option<Arc<Action>> {
        self.actions.iter().find(|a| a.id == *id).cloned()
    }

    /// Run the phases over the graph. `initial_subfeeds` seeds every
    /// phase's traversal (DAG-start feeds plus recovered results);
    /// `run_state` carries precompleted actions from recovery. With a
    /// store, the state is persisted after every exec-phase change and at
    /// the end of the run. `stop_after` truncates the phase sequence
    /// (config test / dry run).
    pub async fn run(
        &self,
        ctx: Arc<ActionPipelineContext>,
        initial_subfeeds: BTreeMap<DataObjectId, SubFeed>,
        run_state: RunState,
        store: Option<Arc<dyn StateStore>>,
        stop_after: Option<ExecutionPhase>,
    ) -> RunOutcome {
        let run_state = Arc::new(Mutex::new(run_state));
        let phases = [
            ExecutionPhase::Prepare,
            ExecutionPhase::Init,
            ExecutionPhase::Exec,
        ];

        let mut first_error: Option<OrchestrationError> = None;
        let mut stopped_early = false;
        for phase in phases {
            tracing::info!(
                phase = %phase,
                actions = self.actions.len(),
                parallelism = self.options.parallelism,
                "Starting phase"
            );
            let result = self
                .run_phase(phase, &ctx, &initial_subfeeds, &run_state, store.as_ref())
                .await;
            stopped_early = stopped_early || result.stopped_early;
            if let Some(err) = result.first_error {
                first_error = Some(err);
                break;
            }
            if stop_after == Some(phase) {
                tracing::info!(phase = %phase, "Stopping after phase as requested");
                break;
            }
            if stopped_early {
                break;
            }
        }

        {
            let mut state = run_state.lock().unwrap_or_else(PoisonError::into_inner);
            state.end_time = Some(Utc::now());
        }
        if let Some(store) = &store {
            if let Err(err) = Self::persist(store, &run_state).await {
                tracing::error!(error = %err, "Failed to persist final run state");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        let state = run_state.lock().unwrap_or_else(PoisonError::into_inner).clone();
        RunOutcome {
            state,
            first_error,
            stopped_early,
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn run_phase(
        &self,
        phase: ExecutionPhase,
        ctx: &Arc<ActionPipelineContext>,
        initial_subfeeds: &BTreeMap<DataObjectId, SubFeed>,
        run_state: &Arc<Mutex<RunState>>,
        store: Option<&Arc<dyn StateStore>>,
    ) -> PhaseResult {
        let order = match self.dag.toposort() {
            Ok(order) => order,
            Err(err) => {
                return PhaseResult {
                    first_error: Some(err),
                    stopped_early: false,
                }
            }
        };

        // Actions already final from a recovered attempt are not re-run.
        let precompleted: HashSet<ActionId> = {
            let state = run_state.lock().unwrap_or_else(PoisonError::into_inner);
            order
                .iter()
                .filter(|id| {
                    state
                        .actions
                        .get(id)
                        .is_some_and(|a| a.state == ActionRunState::Succeeded)
                })
                .cloned()
                .collect()
        };

        if phase == ExecutionPhase::Prepare {
            if let Err(err) = self.test_connections(ctx).await {
                return PhaseResult {
                    first_error: Some(err),
                    stopped_early: false,
                };
            }
        }

        let subfeeds: Arc<Mutex<BTreeMap<DataObjectId, SubFeed>>> =
            Arc::new(Mutex::new(initial_subfeeds.clone()));
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let mut join_set: JoinSet<(ActionId, Result<ActionResult>)> = JoinSet::new();

        let mut spawned: HashSet<ActionId> = precompleted.clone();
        let mut finished: HashSet<ActionId> = precompleted.clone();
        let mut cancelled: HashSet<ActionId> = HashSet::new();
        let mut stop_spawning = false;
        let mut stopped_early = false;
        let mut first_error: Option<OrchestrationError> = None;

        loop {
            if !stop_spawning {
                for id in &order {
                    if spawned.contains(id) || cancelled.contains(id) {
                        continue;
                    }
                    let deps = self.dag.upstream(id).unwrap_or_default();
                    if !deps.iter().all(|d| finished.contains(d)) {
                        continue;
                    }
                    let Some(action) = self.action(id) else {
                        continue;
                    };
                    spawned.insert(id.clone());
                    Self::record(run_state, id, |a| {
                        a.start_time = Some(Utc::now());
                    });
                    join_set.spawn(Self::dispatch(
                        phase,
                        action,
                        ctx.clone(),
                        subfeeds.clone(),
                        semaphore.clone(),
                        self.options.action_timeout,
                    ));
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    first_error = Some(OrchestrationError::Infrastructure(anyhow::anyhow!(
                        "action task panicked: {join_err}"
                    )));
                    stop_spawning = true;
                    continue;
                }
            };

            match result {
                Ok(ActionResult::Completed {
                    outputs,
                    metrics,
                    selected_main,
                }) => {
                    finished.insert(id.clone());
                    {
                        let mut map = subfeeds.lock().unwrap_or_else(PoisonError::into_inner);
                        for subfeed in &outputs {
                            map.insert(subfeed.data_object_id.clone(), subfeed.clone());
                        }
                    }
                    let final_state = match phase {
                        ExecutionPhase::Prepare => ActionRunState::Prepared,
                        ExecutionPhase::Init => ActionRunState::Initialized,
                        ExecutionPhase::Exec => ActionRunState::Succeeded,
                    };
                    Self::record(run_state, &id, |a| {
                        a.state = final_state;
                        a.end_time = Some(Utc::now());
                        a.results = outputs.iter().map(SubFeedRecord::from).collect();
                        a.selected_inputs = selected_main
                            .iter()
                            .map(SubFeedRecord::from)
                            .collect();
                        for (key, value) in metrics {
                            a.metrics.insert(key, value);
                        }
                    });
                    tracing::info!(action = %id, phase = %phase, state = %final_state, "Action completed");
                }
                Ok(ActionResult::Skipped { outputs, message }) => {
                    finished.insert(id.clone());
                    {
                        let mut map = subfeeds.lock().unwrap_or_else(PoisonError::into_inner);
                        for subfeed in &outputs {
                            map.insert(subfeed.data_object_id.clone(), subfeed.clone());
                        }
                    }
                    Self::record(run_state, &id, |a| {
                        a.state = ActionRunState::Skipped;
                        a.end_time = Some(Utc::now());
                        a.results = outputs.iter().map(SubFeedRecord::from).collect();
                        a.message = Some(message.clone());
                    });
                    tracing::info!(action = %id, phase = %phase, %message, "Action skipped");
                }
                Err(OrchestrationError::NoDataToProcess {
                    message,
                    stop: true,
                }) => {
                    finished.insert(id.clone());
                    Self::record(run_state, &id, |a| {
                        a.state = ActionRunState::Skipped;
                        a.end_time = Some(Utc::now());
                        a.message = Some(message.clone());
                    });
                    tracing::info!(action = %id, %message, "No data to process, ending run early");
                    stop_spawning = true;
                    stopped_early = true;
                }
                Err(err) => {
                    finished.insert(id.clone());
                    Self::record(run_state, &id, |a| {
                        a.state = ActionRunState::Failed;
                        a.end_time = Some(Utc::now());
                        a.failure_kind = Some(err.category().to_string());
                        a.message = Some(err.to_string());
                    });
                    tracing::error!(action = %id, phase = %phase, error = %err, "Action failed");

                    if self.options.fail_fast {
                        stop_spawning = true;
                        for other in &order {
                            if !spawned.contains(other) {
                                cancelled.insert(other.clone());
                            }
                        }
                    } else {
                        for descendant in self.dag.descendants(&id).unwrap_or_default() {
                            if !spawned.contains(&descendant) {
                                cancelled.insert(descendant.clone());
                            }
                        }
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }

            if phase == ExecutionPhase::Exec || first_error.is_some() {
                if let Some(store) = store {
                    if let Err(err) = Self::persist(store, run_state).await {
                        tracing::error!(error = %err, "Failed to persist run state");
                        if first_error.is_none() {
                            first_error = Some(err);
                            stop_spawning = true;
                        }
                    }
                }
            }
        }

        // Actions never dispatched: cancelled on failure, skipped when the
        // run ended early on a no-data-stop.
        for id in &order {
            if spawned.contains(id) {
                continue;
            }
            let terminal = if stopped_early && first_error.is_none() {
                ActionRunState::Skipped
            } else {
                ActionRunState::Cancelled
            };
            Self::record(run_state, id, |a| {
                a.state = terminal;
                a.message = Some(match terminal {
                    ActionRunState::Skipped => "run ended early: no data to process".to_string(),
                    _ => "cancelled after upstream failure".to_string(),
                });
            });
            tracing::info!(action = %id, state = %terminal, "Action not dispatched");
        }

        PhaseResult {
            first_error,
            stopped_early,
        }
    }

    /// One action task: acquire a worker slot, snapshot the subfeed map,
    /// run the blocking kernel, enforce the timeout.
    async fn dispatch(
        phase: ExecutionPhase,
        action: Arc<Action>,
        ctx: Arc<ActionPipelineContext>,
        subfeeds: Arc<Mutex<BTreeMap<DataObjectId, SubFeed>>>,
        semaphore: Arc<Semaphore>,
        timeout: Option<Duration>,
    ) -> (ActionId, Result<ActionResult>) {
        let id = action.id.clone();
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return (
                    id,
                    Err(OrchestrationError::Infrastructure(anyhow::anyhow!(
                        "scheduler semaphore closed: {e}"
                    ))),
                );
            }
        };

        let incoming: BTreeMap<DataObjectId, SubFeed> = {
            let map = subfeeds.lock().unwrap_or_else(PoisonError::into_inner);
            action
                .inputs
                .iter()
                .filter_map(|input| map.get(input).map(|s| (input.clone(), s.clone())))
                .collect()
        };

        let id_for_task = id.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match phase {
                ExecutionPhase::Prepare => action.prepare(&ctx).map(|()| ActionResult::Completed {
                    outputs: Vec::new(),
                    metrics: BTreeMap::new(),
                    selected_main: None,
                }),
                ExecutionPhase::Init => action.init(&incoming, &ctx).map(Into::into),
                ExecutionPhase::Exec => action.exec(&incoming, &ctx).map(Into::into),
            }
        });

        let joined = if let Some(limit) = timeout {
            match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    return (
                        id,
                        Err(OrchestrationError::task_failed(
                            id_for_task,
                            anyhow::anyhow!("action timed out after {}s", limit.as_secs()),
                        )),
                    );
                }
            }
        } else {
            task.await
        };

        let result = match joined {
            Ok(result) => result,
            Err(join_err) => Err(OrchestrationError::Infrastructure(anyhow::anyhow!(
                "action '{id_for_task}' task panicked: {join_err}"
            ))),
        };
        (id, result)
    }

    async fn test_connections(&self, ctx: &Arc<ActionPipelineContext>) -> Result<()> {
        let connections = ctx.registry.connections();
        if connections.is_empty() {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || {
            for connection in connections {
                connection.test()?;
                tracing::debug!(connection = %connection.id(), "Connection test passed");
            }
            Ok(())
        })
        .await
        .map_err(|e| {
            OrchestrationError::Infrastructure(anyhow::anyhow!(
                "connection test task panicked: {e}"
            ))
        })?
    }

    fn record(
        run_state: &Arc<Mutex<RunState>>,
        id: &ActionId,
        update: impl FnOnce(&mut lakerun_types::state::ActionState),
    ) {
        let mut state = run_state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(action_state) = state.actions.get_mut(id) {
            update(action_state);
        }
    }

    async fn persist(store: &Arc<dyn StateStore>, run_state: &Arc<Mutex<RunState>>) -> Result<()> {
        let snapshot = run_state.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| {
                OrchestrationError::Infrastructure(anyhow::anyhow!(
                    "state save task panicked: {e}"
                ))
            })?
            .map_err(|e| OrchestrationError::Infrastructure(e.into()))
    }
}

impl From<KernelOutcome> for ActionResult {
    fn from(outcome: KernelOutcome) -> Self {
        match outcome {
            KernelOutcome::Completed {
                outputs,
                metrics,
                selected_main,
            } => Self::Completed {
                outputs,
                metrics,
                selected_main,
            },
            KernelOutcome::Skipped { outputs, message } => Self::Skipped { outputs, message },
        }
    }
}

//! Per-attempt execution context.
//!
//! One [`ActionPipelineContext`] is created per run attempt and threaded
//! through the scheduler into every action. It carries the run identity,
//! the instance registry, and the per-attempt execution-mode cache: modes
//! are applied once during init and their results reused during exec (or
//! replayed from a previous attempt during recovery).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lakerun_types::error::Result;
use lakerun_types::expression::ExpressionContext;
use lakerun_types::state::ExecutionId;
use lakerun_types::ActionId;

use crate::mode::ModeResult;
use crate::registry::InstanceRegistry;

/// The three scheduler phases, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPhase {
    /// Validate connections, data objects, and action configuration.
    Prepare,
    /// Build plans without materialising data.
    Init,
    /// Materialise and write.
    Exec,
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prepare => "prepare",
            Self::Init => "init",
            Self::Exec => "exec",
        };
        f.write_str(s)
    }
}

/// Context shared by all actions of one run attempt.
pub struct ActionPipelineContext {
    pub app_name: String,
    pub feed_sel: String,
    pub execution_id: ExecutionId,
    pub registry: Arc<InstanceRegistry>,
    /// Mode results computed in init (or replayed from a prior attempt),
    /// reused in exec.
    mode_results: Mutex<HashMap<ActionId, Option<ModeResult>>>,
    /// Next stream offsets observed by streaming reads during exec,
    /// consumed by `post_exec`.
    stream_offsets: Mutex<HashMap<ActionId, u64>>,
}

impl ActionPipelineContext {
    /// Fresh context for one attempt.
    #[must_use]
    pub fn new(
        app_name: impl Into<String>,
        feed_sel: impl Into<String>,
        execution_id: ExecutionId,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            feed_sel: feed_sel.into(),
            execution_id,
            registry,
            mode_results: Mutex::new(HashMap::new()),
            stream_offsets: Mutex::new(HashMap::new()),
        }
    }

    /// Cached mode result for an action, if the mode already ran this
    /// attempt. `Some(None)` means the mode ran and declined to rewrite
    /// the subfeed.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the cache lock is poisoned.
    pub fn cached_mode_result(&self, action_id: &ActionId) -> Result<Option<Option<ModeResult>>> {
        Ok(self
            .mode_results
            .lock()
            .map_err(|_| anyhow::anyhow!("mode result cache lock poisoned"))?
            .get(action_id)
            .cloned())
    }

    /// Record a mode result (including a declined application) for reuse
    /// in later phases of the same attempt.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the cache lock is poisoned.
    pub fn cache_mode_result(
        &self,
        action_id: &ActionId,
        result: Option<ModeResult>,
    ) -> Result<()> {
        self.mode_results
            .lock()
            .map_err(|_| anyhow::anyhow!("mode result cache lock poisoned"))?
            .insert(action_id.clone(), result);
        Ok(())
    }

    /// Forget a cached result so the mode is reapplied (streaming
    /// iterations, reset non-leaf actions).
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the cache lock is poisoned.
    pub fn reset_mode_result(&self, action_id: &ActionId) -> Result<()> {
        self.mode_results
            .lock()
            .map_err(|_| anyhow::anyhow!("mode result cache lock poisoned"))?
            .remove(action_id);
        Ok(())
    }

    /// Record the offset a streaming read stopped at.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the offset lock is poisoned.
    pub fn record_stream_offset(&self, action_id: &ActionId, next_offset: u64) -> Result<()> {
        self.stream_offsets
            .lock()
            .map_err(|_| anyhow::anyhow!("stream offset lock poisoned"))?
            .insert(action_id.clone(), next_offset);
        Ok(())
    }

    /// Offset recorded by [`record_stream_offset`](Self::record_stream_offset).
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the offset lock is poisoned.
    pub fn stream_offset(&self, action_id: &ActionId) -> Result<Option<u64>> {
        Ok(self
            .stream_offsets
            .lock()
            .map_err(|_| anyhow::anyhow!("stream offset lock poisoned"))?
            .get(action_id)
            .copied())
    }

    /// Base expression context carrying the run identity.
    #[must_use]
    pub fn expression_context(&self) -> ExpressionContext {
        ExpressionContext::new()
            .with("run_id", self.execution_id.run_id)
            .with("attempt_id", self.execution_id.attempt_id)
            .with("app_name", self.app_name.clone())
            .with("feed", self.feed_sel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakerun_types::expression;
    use lakerun_types::PartitionValues;

    fn context() -> ActionPipelineContext {
        ActionPipelineContext::new(
            "app",
            "compute",
            ExecutionId::initial(),
            Arc::new(InstanceRegistry::new()),
        )
    }

    #[test]
    fn mode_results_are_cached_per_action() {
        let ctx = context();
        let id = ActionId::new("a");
        assert!(ctx.cached_mode_result(&id).unwrap().is_none());

        let result = ModeResult::partitions(vec![PartitionValues::single("dt", "20180101")]);
        ctx.cache_mode_result(&id, Some(result.clone())).unwrap();
        assert_eq!(ctx.cached_mode_result(&id).unwrap(), Some(Some(result)));

        ctx.reset_mode_result(&id).unwrap();
        assert!(ctx.cached_mode_result(&id).unwrap().is_none());
    }

    #[test]
    fn declined_mode_application_is_remembered() {
        let ctx = context();
        let id = ActionId::new("a");
        ctx.cache_mode_result(&id, None).unwrap();
        assert_eq!(ctx.cached_mode_result(&id).unwrap(), Some(None));
    }

    #[test]
    fn stream_offsets_roundtrip() {
        let ctx = context();
        let id = ActionId::new("a");
        assert!(ctx.stream_offset(&id).unwrap().is_none());
        ctx.record_stream_offset(&id, 5).unwrap();
        assert_eq!(ctx.stream_offset(&id).unwrap(), Some(5));
    }

    #[test]
    fn expression_context_exposes_run_identity() {
        let ctx = context();
        let expr_ctx = ctx.expression_context();
        assert!(expression::evaluate_bool("run_id == 1 && attempt_id == 1", &expr_ctx).unwrap());
        assert!(expression::evaluate_bool("feed == 'compute'", &expr_ctx).unwrap());
    }
}

//! Run-state model types.
//!
//! Durable records of runs and attempts. One [`RunState`] is written per
//! attempt; the state store keeps them append-only so a crashed run can be
//! resumed exactly where it stopped. All timestamps are RFC 3339 UTC
//! strings; the documents are forward-compatible (unknown fields are
//! preserved on round-trip through flattened maps).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::ActionId;
use crate::subfeed::SubFeedRecord;

/// Current schema version written to new state files.
pub const STATE_FORMAT_VERSION: u32 = 4;

/// Identifier of one execution pass: `run_id` strictly increases between
/// fresh runs sharing an application name, `attempt_id` strictly increases
/// within a run for recovery attempts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ExecutionId {
    pub run_id: u32,
    pub attempt_id: u32,
}

impl ExecutionId {
    /// First attempt of the first run.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            run_id: 1,
            attempt_id: 1,
        }
    }

    /// First attempt of the next run.
    #[must_use]
    pub fn next_run(self) -> Self {
        Self {
            run_id: self.run_id + 1,
            attempt_id: 1,
        }
    }

    /// Next recovery attempt of the same run.
    #[must_use]
    pub fn next_attempt(self) -> Self {
        Self {
            run_id: self.run_id,
            attempt_id: self.attempt_id + 1,
        }
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.run_id, self.attempt_id)
    }
}

/// Outcome of one action in one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionRunState {
    Pending,
    Prepared,
    Initialized,
    Succeeded,
    Skipped,
    Failed,
    Cancelled,
}

impl ActionRunState {
    /// True once the action will not run again in this attempt.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Skipped | Self::Failed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for ActionRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Prepared => "PREPARED",
            Self::Initialized => "INITIALIZED",
            Self::Succeeded => "SUCCEEDED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Per-action record within a [`RunState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionState {
    pub state: ActionRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Output subfeeds of the action; replayed as downstream inputs on
    /// recovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<SubFeedRecord>,
    /// Input selection computed by the execution mode (replayed verbatim
    /// by a recovery attempt).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_inputs: Vec<SubFeedRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ActionState {
    /// Fresh pending record.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: ActionRunState::Pending,
            start_time: None,
            end_time: None,
            results: Vec::new(),
            selected_inputs: Vec::new(),
            metrics: BTreeMap::new(),
            failure_kind: None,
            message: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Durable record of a single run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub app_name: String,
    pub run_id: u32,
    pub attempt_id: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Digest of the frozen configuration this attempt ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
    pub actions: BTreeMap<ActionId, ActionState>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_format_version() -> u32 {
    1
}

impl RunState {
    /// New attempt record with every action pending.
    #[must_use]
    pub fn new(
        app_name: impl Into<String>,
        execution_id: ExecutionId,
        start_time: DateTime<Utc>,
        action_ids: impl IntoIterator<Item = ActionId>,
    ) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            app_name: app_name.into(),
            run_id: execution_id.run_id,
            attempt_id: execution_id.attempt_id,
            start_time,
            end_time: None,
            config_digest: None,
            actions: action_ids
                .into_iter()
                .map(|id| (id, ActionState::pending()))
                .collect(),
            extra: BTreeMap::new(),
        }
    }

    /// The execution id of this attempt.
    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        ExecutionId {
            run_id: self.run_id,
            attempt_id: self.attempt_id,
        }
    }

    /// True if any action failed in this attempt.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.actions
            .values()
            .any(|a| a.state == ActionRunState::Failed)
    }

    /// True if every action reached `SUCCEEDED` or `SKIPPED`.
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.actions
            .values()
            .all(|a| matches!(a.state, ActionRunState::Succeeded | ActionRunState::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_id_progression() {
        let first = ExecutionId::initial();
        assert_eq!(first.to_string(), "1.1");
        assert_eq!(first.next_attempt().to_string(), "1.2");
        assert_eq!(first.next_run().to_string(), "2.1");
        assert_eq!(first.next_attempt().next_run().to_string(), "2.1");
    }

    #[test]
    fn action_run_state_finality() {
        assert!(ActionRunState::Succeeded.is_final());
        assert!(ActionRunState::Cancelled.is_final());
        assert!(!ActionRunState::Pending.is_final());
        assert!(!ActionRunState::Initialized.is_final());
    }

    #[test]
    fn action_run_state_serde_is_screaming() {
        let json = serde_json::to_string(&ActionRunState::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }

    #[test]
    fn run_state_success_and_failure_predicates() {
        let mut state = RunState::new(
            "app",
            ExecutionId::initial(),
            Utc::now(),
            [ActionId::new("a"), ActionId::new("b")],
        );
        assert!(!state.is_succeeded());
        assert!(!state.has_failures());

        state.actions.get_mut(&ActionId::new("a")).unwrap().state = ActionRunState::Succeeded;
        state.actions.get_mut(&ActionId::new("b")).unwrap().state = ActionRunState::Skipped;
        assert!(state.is_succeeded());

        state.actions.get_mut(&ActionId::new("b")).unwrap().state = ActionRunState::Failed;
        assert!(state.has_failures());
        assert!(!state.is_succeeded());
    }

    #[test]
    fn run_state_roundtrip_preserves_unknown_fields() {
        let raw = json!({
            "format_version": 99,
            "app_name": "app",
            "run_id": 1,
            "attempt_id": 1,
            "start_time": "2026-01-15T10:00:00Z",
            "actions": {},
            "added_in_v99": [1, 2, 3]
        });
        let state: RunState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(state.format_version, 99);
        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["added_in_v99"], raw["added_in_v99"]);
    }

    #[test]
    fn run_state_new_marks_all_actions_pending() {
        let state = RunState::new(
            "app",
            ExecutionId::initial(),
            Utc::now(),
            [ActionId::new("a")],
        );
        assert_eq!(
            state.actions[&ActionId::new("a")].state,
            ActionRunState::Pending
        );
        assert_eq!(state.format_version, STATE_FORMAT_VERSION);
    }
}

//! Orchestration error taxonomy.
//!
//! Errors are categorised so the scheduler and driver can decide how to
//! react: soft no-data conditions are converted into subfeed annotations at
//! the action boundary, hard failures mark the action failed and cancel its
//! descendants, configuration and precondition problems abort the run
//! before anything is written.

use crate::id::ActionId;

/// Categorised orchestration error.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// Invalid or inconsistent configuration; detected before exec.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend unreachable, schema mismatch, or similar environment
    /// problem detected during prepare.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An execution mode found nothing to process. `stop = false` lets the
    /// run continue with empty subfeeds; `stop = true` ends the run early
    /// (still successfully).
    #[error("no data to process: {message}")]
    NoDataToProcess { message: String, stop: bool },

    /// A transformation or engine call failed; fatal for the action.
    #[error("action {action} failed: {source}")]
    TaskFailed {
        action: ActionId,
        #[source]
        source: anyhow::Error,
    },

    /// The action was never run because an upstream failure cancelled it.
    #[error("action {0} cancelled")]
    Cancelled(ActionId),

    /// Host-side problem outside the taxonomy (state store, I/O, runtime).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl OrchestrationError {
    /// Soft no-data error that keeps the run going.
    #[must_use]
    pub fn no_data_dont_stop(message: impl Into<String>) -> Self {
        Self::NoDataToProcess {
            message: message.into(),
            stop: false,
        }
    }

    /// Soft no-data error that ends the run early.
    #[must_use]
    pub fn no_data_stop(message: impl Into<String>) -> Self {
        Self::NoDataToProcess {
            message: message.into(),
            stop: true,
        }
    }

    /// Wrap an engine or transformation failure for `action`.
    #[must_use]
    pub fn task_failed(action: ActionId, source: anyhow::Error) -> Self {
        Self::TaskFailed { action, source }
    }

    /// Soft errors are caught at the action boundary and converted into
    /// subfeed annotations; everything else bubbles to the scheduler.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NoDataToProcess { .. } | Self::Cancelled(_))
    }

    /// Stable category string for state files and logs.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Precondition(_) => "precondition",
            Self::NoDataToProcess { stop: false, .. } => "no_data_dont_stop",
            Self::NoDataToProcess { stop: true, .. } => "no_data_stop",
            Self::TaskFailed { .. } => "task_failed",
            Self::Cancelled(_) => "cancelled",
            Self::Infrastructure(_) => "infrastructure",
        }
    }

    /// Process exit code the driver surfaces for this error: 0 for soft
    /// no-data conditions, 1 for configuration problems, 2 for execution
    /// failures.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoDataToProcess { .. } => 0,
            Self::Config(_) => 1,
            Self::Precondition(_)
            | Self::TaskFailed { .. }
            | Self::Cancelled(_)
            | Self::Infrastructure(_) => 2,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

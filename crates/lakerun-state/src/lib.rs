//! Durable run-state storage for the lakerun orchestrator.
//!
//! One append-only JSON record per run attempt, written after every
//! action-state change during exec. The store is the recovery source of
//! truth: a failed run resumes from the latest attempt record.

pub mod error;
mod file;
mod store;

pub use error::StateError;
pub use file::FileStateStore;
pub use store::{RetentionPolicy, StateFileRef, StateStore};

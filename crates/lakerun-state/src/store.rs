//! State store trait definition.
//!
//! [`StateStore`] defines the storage contract for durable run records.
//! Model types live in [`lakerun_types::state`].

use std::path::{Path, PathBuf};

use chrono::Duration;
use lakerun_types::state::RunState;

use crate::error;

/// Reference to one attempt record on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFileRef {
    pub path: PathBuf,
    pub app_name: String,
    pub run_id: u32,
    pub attempt_id: u32,
    /// Milliseconds since epoch encoded in the file name.
    pub timestamp_millis: i64,
}

/// Retention policy applied after each save. The newest record is never
/// deleted regardless of policy.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    /// Keep at most this many attempt records per application.
    pub max_files: Option<usize>,
    /// Delete records older than this.
    pub max_age: Option<Duration>,
}

/// Storage contract for run state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`,
/// and must serialise writes: one writer at a time per application name.
pub trait StateStore: Send + Sync {
    /// Atomically write a new attempt record. Existing records are never
    /// modified.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn save(&self, state: &RunState) -> error::Result<()>;

    /// The newest attempt record for `app_name`, if any exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get_latest(&self, app_name: &str) -> error::Result<Option<StateFileRef>>;

    /// Load an attempt record from a path previously returned by
    /// [`get_latest`](Self::get_latest) or [`list`](Self::list).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`](crate::StateError::NotFound) if the
    /// file does not exist, or another [`StateError`](crate::StateError)
    /// on storage failure.
    fn recover(&self, path: &Path) -> error::Result<RunState>;

    /// All attempt records for `app_name`, ordered newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn list(&self, app_name: &str) -> error::Result<Vec<StateFileRef>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn StateStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateStore) {}
    }
}

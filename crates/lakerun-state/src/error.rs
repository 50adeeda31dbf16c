//! State store error types.

use std::path::PathBuf;

/// Errors produced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// File-system failure (creating directories, writing or renaming
    /// attempt files).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An attempt record could not be encoded or decoded.
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The referenced state file does not exist.
    #[error("state file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

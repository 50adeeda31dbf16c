//! Shared model types for the lakerun orchestrator.
//!
//! Pure data types used across the engine, state store, and CLI. Kept in a
//! leaf crate so the other workspace members can share them without
//! circular dependencies.

pub mod error;
pub mod expression;
pub mod frame;
pub mod id;
pub mod partition;
pub mod state;
pub mod subfeed;

pub use error::OrchestrationError;
pub use frame::DataFrame;
pub use id::{ActionId, ConnectionId, DataObjectId};
pub use partition::PartitionValues;
pub use subfeed::SubFeed;

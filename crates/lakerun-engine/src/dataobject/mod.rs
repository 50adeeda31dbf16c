//! Data-object contracts.
//!
//! A data object is a logical, addressable dataset. The engine never talks
//! to a backend directly; it goes through the capability traits here, and
//! backends advertise what they support through the accessor methods on
//! [`DataObject`]. The registry rejects configurations where a referenced
//! data object lacks a capability an action requires.

mod json_file;
mod memory;

pub use json_file::JsonFileDataObject;
pub use memory::{read_offset, write_offset, MemoryStreamDataObject, MemoryTableDataObject};

use serde::{Deserialize, Serialize};

use lakerun_types::error::Result;
use lakerun_types::{ConnectionId, DataFrame, DataObjectId, PartitionValues};

/// How writes combine with existing data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Replace the written partitions (or the whole object when no
    /// partition values are given).
    Overwrite,
    /// Add rows, keeping existing data.
    #[default]
    Append,
    /// Upsert by primary key; requires the mergeable capability.
    Merge,
}

/// Base contract every data object implements.
pub trait DataObject: Send + Sync {
    /// The object's id.
    fn id(&self) -> &DataObjectId;

    /// Connection this object goes through, if any.
    fn connection_id(&self) -> Option<&ConnectionId> {
        None
    }

    /// Existence/schema check run once during the prepare phase. No data
    /// is read.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the backend is unreachable or the
    /// object is in an unusable state.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Readable view, if this object supports reading.
    fn readable(&self) -> Option<&dyn CanRead> {
        None
    }

    /// Writable view, if this object supports writing.
    fn writable(&self) -> Option<&dyn CanWrite> {
        None
    }

    /// Partition handling, if this object is partitioned.
    fn partitioned(&self) -> Option<&dyn CanHandlePartitions> {
        None
    }

    /// Transactional writes, if supported.
    fn transactional(&self) -> Option<&dyn Transactional> {
        None
    }

    /// Merge (upsert) capability, if supported.
    fn mergeable(&self) -> Option<&dyn CanMerge> {
        None
    }

    /// Streaming micro-batch reads, if supported.
    fn streamable(&self) -> Option<&dyn CanCreateStreamingFrame> {
        None
    }
}

/// Read a frame, optionally restricted to partition values. An empty
/// selection means the whole object.
pub trait CanRead: Send + Sync {
    /// # Errors
    ///
    /// Returns a precondition error if the object cannot be read.
    fn read(&self, partition_values: &[PartitionValues]) -> Result<DataFrame>;
}

/// Write a frame under the object's configured [`SaveMode`]. Returns the
/// number of rows written.
pub trait CanWrite: Send + Sync {
    /// The configured save mode.
    fn save_mode(&self) -> SaveMode;

    /// # Errors
    ///
    /// Returns a task failure if the write cannot be completed.
    fn write(&self, frame: &DataFrame, partition_values: &[PartitionValues]) -> Result<u64>;
}

/// Partition scheme and current contents.
pub trait CanHandlePartitions: Send + Sync {
    /// Declared partition columns, most significant first.
    fn partition_columns(&self) -> Vec<String>;

    /// Partition values currently present in the object.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the listing fails.
    fn list_partitions(&self) -> Result<Vec<PartitionValues>>;
}

/// All-or-nothing write semantics.
pub trait Transactional: Send + Sync {
    /// # Errors
    ///
    /// Returns a task failure if a transaction cannot be started.
    fn begin(&self) -> Result<()>;

    /// # Errors
    ///
    /// Returns a task failure if the commit fails.
    fn commit(&self) -> Result<()>;

    /// # Errors
    ///
    /// Returns a task failure if the rollback fails.
    fn rollback(&self) -> Result<()>;
}

/// Upsert-by-key capability.
pub trait CanMerge: Send + Sync {
    /// Primary-key columns used to match existing rows.
    fn primary_key(&self) -> Vec<String>;
}

/// Offset-based streaming micro-batch reads.
pub trait CanCreateStreamingFrame: Send + Sync {
    /// Read up to `max_batches` batches starting at `from_offset`.
    /// Returns the frame and the offset to resume from.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the stream cannot be read.
    fn read_stream(&self, from_offset: u64, max_batches: usize) -> Result<(DataFrame, u64)>;
}

/// Partition columns of an object, empty when it is not partitioned.
#[must_use]
pub fn partition_columns_of(object: &dyn DataObject) -> Vec<String> {
    object
        .partitioned()
        .map(CanHandlePartitions::partition_columns)
        .unwrap_or_default()
}

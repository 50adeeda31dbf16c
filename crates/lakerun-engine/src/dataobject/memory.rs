//! In-memory data objects.
//!
//! [`MemoryTableDataObject`] is a partitioned, optionally mergeable table
//! held in process memory; [`MemoryStreamDataObject`] is an ordered queue
//! of batches with a durable offset. Both back the integration suite and
//! small embedded pipelines.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use serde_json::Value;

use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::{DataFrame, DataObjectId, PartitionValues};

use super::{
    CanCreateStreamingFrame, CanHandlePartitions, CanMerge, CanRead, CanWrite, DataObject,
    SaveMode, Transactional,
};

/// Partitioned in-memory table.
pub struct MemoryTableDataObject {
    id: DataObjectId,
    partition_columns: Vec<String>,
    primary_key: Vec<String>,
    save_mode: SaveMode,
    rows: Mutex<Vec<Value>>,
    /// Uncommitted rows staged by an open transaction.
    staged: Mutex<Option<Vec<Value>>>,
}

impl MemoryTableDataObject {
    /// Empty table without partitions, append save mode.
    #[must_use]
    pub fn new(id: impl Into<DataObjectId>) -> Self {
        Self {
            id: id.into(),
            partition_columns: Vec::new(),
            primary_key: Vec::new(),
            save_mode: SaveMode::Append,
            rows: Mutex::new(Vec::new()),
            staged: Mutex::new(None),
        }
    }

    /// Declare partition columns, most significant first.
    #[must_use]
    pub fn with_partition_columns<S: Into<String>, I: IntoIterator<Item = S>>(
        mut self,
        columns: I,
    ) -> Self {
        self.partition_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a primary key; enables the merge capability.
    #[must_use]
    pub fn with_primary_key<S: Into<String>, I: IntoIterator<Item = S>>(
        mut self,
        columns: I,
    ) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the save mode.
    #[must_use]
    pub fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }

    /// Seed initial content (test fixtures).
    #[must_use]
    pub fn with_rows(self, rows: Vec<Value>) -> Self {
        *self.rows.lock().unwrap_or_else(PoisonError::into_inner) = rows;
        self
    }

    /// Snapshot of the current rows.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the row lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<Value>> {
        Ok(self.lock_rows()?.clone())
    }

    fn lock_rows(&self) -> Result<std::sync::MutexGuard<'_, Vec<Value>>> {
        self.rows
            .lock()
            .map_err(|_| anyhow::anyhow!("memory table '{}' lock poisoned", self.id).into())
    }

    fn key_of(&self, row: &Value) -> Vec<String> {
        self.primary_key
            .iter()
            .map(|col| render_value(row.get(col)))
            .collect()
    }

    fn apply_write(&self, rows: &mut Vec<Value>, frame: &DataFrame, partition_values: &[PartitionValues]) {
        match self.save_mode {
            SaveMode::Overwrite => {
                if partition_values.is_empty() {
                    rows.clear();
                } else {
                    rows.retain(|row| {
                        !partition_values.iter().any(|pv| {
                            pv.iter().all(|(col, val)| {
                                render_value(row.get(col)) == val
                            })
                        })
                    });
                }
                rows.extend(frame.rows().iter().cloned());
            }
            SaveMode::Append => rows.extend(frame.rows().iter().cloned()),
            SaveMode::Merge => {
                for new_row in frame.rows() {
                    let key = self.key_of(new_row);
                    if let Some(existing) =
                        rows.iter_mut().find(|row| self.key_of(row) == key)
                    {
                        *existing = new_row.clone();
                    } else {
                        rows.push(new_row.clone());
                    }
                }
            }
        }
    }
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl DataObject for MemoryTableDataObject {
    fn id(&self) -> &DataObjectId {
        &self.id
    }

    fn readable(&self) -> Option<&dyn CanRead> {
        Some(self)
    }

    fn writable(&self) -> Option<&dyn CanWrite> {
        Some(self)
    }

    fn partitioned(&self) -> Option<&dyn CanHandlePartitions> {
        if self.partition_columns.is_empty() {
            None
        } else {
            Some(self)
        }
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }

    fn mergeable(&self) -> Option<&dyn CanMerge> {
        if self.primary_key.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl CanRead for MemoryTableDataObject {
    fn read(&self, partition_values: &[PartitionValues]) -> Result<DataFrame> {
        let rows = self.lock_rows()?;
        Ok(DataFrame::from_rows(rows.clone()).filter_partition_values(partition_values))
    }
}

impl CanWrite for MemoryTableDataObject {
    fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    fn write(&self, frame: &DataFrame, partition_values: &[PartitionValues]) -> Result<u64> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| anyhow::anyhow!("memory table '{}' lock poisoned", self.id))?;
        if let Some(pending) = staged.as_mut() {
            self.apply_write(pending, frame, partition_values);
        } else {
            let mut rows = self.lock_rows()?;
            self.apply_write(&mut rows, frame, partition_values);
        }
        Ok(frame.num_rows() as u64)
    }
}

impl CanHandlePartitions for MemoryTableDataObject {
    fn partition_columns(&self) -> Vec<String> {
        self.partition_columns.clone()
    }

    fn list_partitions(&self) -> Result<Vec<PartitionValues>> {
        let rows = self.lock_rows()?;
        Ok(DataFrame::from_rows(rows.clone()).partition_values(&self.partition_columns))
    }
}

impl Transactional for MemoryTableDataObject {
    fn begin(&self) -> Result<()> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| anyhow::anyhow!("memory table '{}' lock poisoned", self.id))?;
        if staged.is_some() {
            return Err(OrchestrationError::Precondition(format!(
                "transaction already open on '{}'",
                self.id
            )));
        }
        *staged = Some(self.lock_rows()?.clone());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| anyhow::anyhow!("memory table '{}' lock poisoned", self.id))?;
        let pending = staged.take().ok_or_else(|| {
            OrchestrationError::Precondition(format!("no open transaction on '{}'", self.id))
        })?;
        *self.lock_rows()? = pending;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| anyhow::anyhow!("memory table '{}' lock poisoned", self.id))?;
        staged.take();
        Ok(())
    }
}

impl CanMerge for MemoryTableDataObject {
    fn primary_key(&self) -> Vec<String> {
        self.primary_key.clone()
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Ordered queue of batches with an offset-based streaming read.
///
/// The consumption offset itself is owned by the execution mode (persisted
/// under its checkpoint location); the object only serves batches.
pub struct MemoryStreamDataObject {
    id: DataObjectId,
    batches: Mutex<Vec<DataFrame>>,
}

impl MemoryStreamDataObject {
    /// Empty stream.
    #[must_use]
    pub fn new(id: impl Into<DataObjectId>) -> Self {
        Self {
            id: id.into(),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Append a batch to the stream.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the batch lock is poisoned.
    pub fn push_batch(&self, batch: DataFrame) -> Result<()> {
        self.batches
            .lock()
            .map_err(|_| anyhow::anyhow!("memory stream '{}' lock poisoned", self.id))?
            .push(batch);
        Ok(())
    }
}

impl DataObject for MemoryStreamDataObject {
    fn id(&self) -> &DataObjectId {
        &self.id
    }

    fn streamable(&self) -> Option<&dyn CanCreateStreamingFrame> {
        Some(self)
    }

    fn readable(&self) -> Option<&dyn CanRead> {
        Some(self)
    }
}

impl CanRead for MemoryStreamDataObject {
    fn read(&self, _partition_values: &[PartitionValues]) -> Result<DataFrame> {
        let batches = self
            .batches
            .lock()
            .map_err(|_| anyhow::anyhow!("memory stream '{}' lock poisoned", self.id))?;
        Ok(batches
            .iter()
            .fold(DataFrame::default(), |acc, b| acc.union(b)))
    }
}

impl CanCreateStreamingFrame for MemoryStreamDataObject {
    fn read_stream(&self, from_offset: u64, max_batches: usize) -> Result<(DataFrame, u64)> {
        let batches = self
            .batches
            .lock()
            .map_err(|_| anyhow::anyhow!("memory stream '{}' lock poisoned", self.id))?;
        let start = usize::try_from(from_offset).unwrap_or(usize::MAX).min(batches.len());
        let end = start.saturating_add(max_batches).min(batches.len());
        let frame = batches[start..end]
            .iter()
            .fold(DataFrame::default(), |acc, b| acc.union(b));
        Ok((frame, end as u64))
    }
}

/// Read a persisted stream offset from `path`; 0 when the file does not
/// exist yet.
///
/// # Errors
///
/// Returns an infrastructure error if the file exists but cannot be read
/// or parsed.
pub fn read_offset(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading stream offset {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("parsing stream offset {}", path.display()))
        .map_err(Into::into)
}

/// Persist a stream offset to `path`, creating parent directories.
///
/// # Errors
///
/// Returns an infrastructure error on I/O failure.
pub fn write_offset(path: &Path, offset: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
    }
    fs::write(path, offset.to_string())
        .with_context(|| format!("writing stream offset {}", path.display()))?;
    Ok(())
}

//! JSON-lines file data object.
//!
//! Rows are stored one JSON object per line under a base directory, with
//! partitions laid out as `col=value` subdirectories:
//!
//! ```text
//! <base>/dt=20180101/type=person/data.jsonl
//! ```
//!
//! Unpartitioned objects keep a single `data.jsonl` at the base.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;

use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::{DataFrame, DataObjectId, PartitionValues};

use super::{CanHandlePartitions, CanRead, CanWrite, DataObject, SaveMode};

const DATA_FILE: &str = "data.jsonl";

/// File-backed data object storing JSON-lines under partition directories.
pub struct JsonFileDataObject {
    id: DataObjectId,
    base_path: PathBuf,
    partition_columns: Vec<String>,
    save_mode: SaveMode,
}

impl JsonFileDataObject {
    /// Object rooted at `base_path`, append save mode, no partitions.
    #[must_use]
    pub fn new(id: impl Into<DataObjectId>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_path: base_path.into(),
            partition_columns: Vec::new(),
            save_mode: SaveMode::Append,
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

    /// Set the save mode.
    #[must_use]
    pub fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }

    /// True once something has been written.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.base_path.exists()
    }

    fn partition_dir(&self, pv: &PartitionValues) -> PathBuf {
        let mut dir = self.base_path.clone();
        for col in &self.partition_columns {
            let value = pv.get(col).unwrap_or("");
            dir = dir.join(format!("{col}={value}"));
        }
        dir
    }

    fn read_file(path: &Path) -> Result<Vec<Value>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("parsing row in {}", path.display()))
                    .map_err(Into::into)
            })
            .collect()
    }

    fn write_file(path: &Path, rows: &[Value], append: bool) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut content = String::new();
        for row in rows {
            content.push_str(&row.to_string());
            content.push('\n');
        }
        if append && path.exists() {
            let mut existing = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            existing.push_str(&content);
            content = existing;
        }
        fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Recursively collect `data.jsonl` files below `dir` together with the
    /// partition values encoded in their directory path.
    fn collect_files(
        &self,
        dir: &Path,
        current: &PartitionValues,
        out: &mut Vec<(PathBuf, PartitionValues)>,
    ) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some((col, value)) = name.split_once('=') {
                    let nested = PartitionValues::from_pairs(
                        current.iter().chain(std::iter::once((col, value))),
                    );
                    self.collect_files(&path, &nested, out)?;
                }
            } else if path.file_name().is_some_and(|n| n == DATA_FILE) {
                out.push((path, current.clone()));
            }
        }
        Ok(())
    }
}

impl DataObject for JsonFileDataObject {
    fn id(&self) -> &DataObjectId {
        &self.id
    }

    fn prepare(&self) -> Result<()> {
        // The base may not exist yet for a pure output; its parent must be
        // usable though.
        let probe = if self.base_path.exists() {
            self.base_path.clone()
        } else {
            self.base_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };
        if probe.exists() && !probe.is_dir() {
            return Err(OrchestrationError::Precondition(format!(
                "data object '{}': {} is not a directory",
                self.id,
                probe.display()
            )));
        }
        Ok(())
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
}

impl CanRead for JsonFileDataObject {
    fn read(&self, partition_values: &[PartitionValues]) -> Result<DataFrame> {
        let mut files = Vec::new();
        self.collect_files(&self.base_path, &PartitionValues::new(), &mut files)?;
        let mut rows = Vec::new();
        for (path, file_pv) in files {
            let selected = partition_values.is_empty()
                || partition_values.iter().any(|pv| pv.is_included_in(&file_pv));
            if selected {
                rows.extend(Self::read_file(&path)?);
            }
        }
        Ok(DataFrame::from_rows(rows))
    }
}

impl CanWrite for JsonFileDataObject {
    fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    fn write(&self, frame: &DataFrame, partition_values: &[PartitionValues]) -> Result<u64> {
        if self.save_mode == SaveMode::Merge {
            return Err(OrchestrationError::Config(format!(
                "data object '{}' does not support merge",
                self.id
            )));
        }
        if self.partition_columns.is_empty() {
            let path = self.base_path.join(DATA_FILE);
            match self.save_mode {
                SaveMode::Append => Self::write_file(&path, frame.rows(), true)?,
                SaveMode::Overwrite | SaveMode::Merge => {
                    Self::write_file(&path, frame.rows(), false)?;
                }
            }
            return Ok(frame.num_rows() as u64);
        }

        // Partitioned: bucket rows by their partition directory.
        if self.save_mode == SaveMode::Overwrite {
            for pv in partition_values {
                let dir = self.partition_dir(&pv.project(&self.partition_columns));
                if dir.exists() {
                    fs::remove_dir_all(&dir)
                        .with_context(|| format!("clearing {}", dir.display()))?;
                }
            }
        }
        let mut buckets: Vec<(PathBuf, Vec<Value>)> = Vec::new();
        for row in frame.rows() {
            let pv = PartitionValues::from_pairs(self.partition_columns.iter().filter_map(
                |col| {
                    row.get(col).map(|v| {
                        let rendered = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (col.clone(), rendered)
                    })
                },
            ));
            let path = self.partition_dir(&pv).join(DATA_FILE);
            match buckets.iter_mut().find(|(p, _)| *p == path) {
                Some((_, bucket)) => bucket.push(row.clone()),
                None => buckets.push((path, vec![row.clone()])),
            }
        }
        for (path, bucket) in buckets {
            // Overwrite already cleared the directories above.
            Self::write_file(&path, &bucket, self.save_mode == SaveMode::Append)?;
        }
        Ok(frame.num_rows() as u64)
    }
}

impl CanHandlePartitions for JsonFileDataObject {
    fn partition_columns(&self) -> Vec<String> {
        self.partition_columns.clone()
    }

    fn list_partitions(&self) -> Result<Vec<PartitionValues>> {
        let mut files = Vec::new();
        self.collect_files(&self.base_path, &PartitionValues::new(), &mut files)?;
        let mut partitions: Vec<PartitionValues> = Vec::new();
        for (_, pv) in files {
            if !pv.is_empty() && !partitions.contains(&pv) {
                partitions.push(pv);
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}

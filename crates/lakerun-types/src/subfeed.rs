//! The subfeed protocol.
//!
//! A [`SubFeed`] is the typed message flowing along a DAG edge: it names
//! the data object, the partition values to process, lineage and skip
//! flags, an optional row filter, and an engine payload. Subfeeds are
//! immutable from the perspective of their recipients; every
//! transformation returns a new instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::DataFrame;
use crate::id::DataObjectId;
use crate::partition::PartitionValues;

/// Message passed between actions describing what to process for one data
/// object.
///
/// The payload is an engine handle and never crosses a process boundary;
/// it is dropped on serialization (see [`SubFeedRecord`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubFeed {
    pub data_object_id: DataObjectId,
    pub partition_values: Vec<PartitionValues>,
    pub is_dag_start: bool,
    pub is_skipped: bool,
    pub filter: Option<String>,
    pub payload: Option<DataFrame>,
}

impl SubFeed {
    /// Subfeed for a data object with no selection (process everything).
    #[must_use]
    pub fn new(data_object_id: DataObjectId) -> Self {
        Self {
            data_object_id,
            ..Self::default()
        }
    }

    /// Subfeed synthesised by the driver for a DAG-start action.
    #[must_use]
    pub fn dag_start(data_object_id: DataObjectId, partition_values: Vec<PartitionValues>) -> Self {
        Self {
            data_object_id,
            partition_values,
            is_dag_start: true,
            ..Self::default()
        }
    }

    /// Project partition values onto the target data object's partition
    /// columns. Extra keys are silently dropped; records that become empty
    /// are removed (the data object then contributes no filter); duplicates
    /// introduced by the projection are collapsed.
    #[must_use]
    pub fn project<S: AsRef<str>>(&self, partition_columns: &[S]) -> Self {
        let mut projected: Vec<PartitionValues> = Vec::new();
        for pv in &self.partition_values {
            let p = pv.project(partition_columns);
            if !p.is_empty() && !projected.contains(&p) {
                projected.push(p);
            }
        }
        Self {
            partition_values: projected,
            ..self.clone()
        }
    }

    /// Replace partition values and filter with the selection computed by
    /// an execution mode. The payload is dropped: the mode changed the data
    /// set between planning and execution, so downstream must
    /// re-materialise from the data object.
    #[must_use]
    pub fn with_selection(
        &self,
        partition_values: Vec<PartitionValues>,
        filter: Option<String>,
    ) -> Self {
        Self {
            partition_values,
            filter,
            payload: None,
            ..self.clone()
        }
    }

    /// Drop the payload so the downstream action re-materialises from the
    /// data object rather than chaining engine-level plans.
    #[must_use]
    pub fn break_lineage(&self) -> Self {
        Self {
            payload: None,
            ..self.clone()
        }
    }

    /// Skipped variant: empty partition values, no filter, no payload.
    #[must_use]
    pub fn as_skipped(&self) -> Self {
        Self {
            data_object_id: self.data_object_id.clone(),
            partition_values: Vec::new(),
            is_dag_start: self.is_dag_start,
            is_skipped: true,
            filter: None,
            payload: None,
        }
    }

    /// Clear the DAG-start marker (set when a subfeed is handed to a
    /// downstream action).
    #[must_use]
    pub fn cleared_dag_start(&self) -> Self {
        Self {
            is_dag_start: false,
            ..self.clone()
        }
    }

    /// JSON rendering of the partition values for expression contexts.
    #[must_use]
    pub fn partition_values_json(&self) -> Value {
        Value::Array(
            self.partition_values
                .iter()
                .map(PartitionValues::expr_context)
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Durable form
// ---------------------------------------------------------------------------

/// Kind tag for durable subfeed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubFeedKind {
    /// No engine payload was attached.
    Generic,
    /// The live subfeed carried a frame payload (dropped on save).
    Frame,
}

/// Serialisable form of a subfeed as written to state files.
///
/// Forward-compatible: fields written by newer versions are preserved on
/// round-trip through the flattened `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubFeedRecord {
    pub kind: SubFeedKind,
    pub data_object_id: DataObjectId,
    pub partition_values: Vec<PartitionValues>,
    #[serde(default)]
    pub is_dag_start: bool,
    #[serde(default)]
    pub is_skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl From<&SubFeed> for SubFeedRecord {
    fn from(subfeed: &SubFeed) -> Self {
        Self {
            kind: if subfeed.payload.is_some() {
                SubFeedKind::Frame
            } else {
                SubFeedKind::Generic
            },
            data_object_id: subfeed.data_object_id.clone(),
            partition_values: subfeed.partition_values.clone(),
            is_dag_start: subfeed.is_dag_start,
            is_skipped: subfeed.is_skipped,
            filter: subfeed.filter.clone(),
            extra: BTreeMap::new(),
        }
    }
}

impl SubFeedRecord {
    /// Rebuild a live subfeed. The payload is gone by construction; the
    /// receiving action re-materialises from the data object.
    #[must_use]
    pub fn to_subfeed(&self) -> SubFeed {
        SubFeed {
            data_object_id: self.data_object_id.clone(),
            partition_values: self.partition_values.clone(),
            is_dag_start: self.is_dag_start,
            is_skipped: self.is_skipped,
            filter: self.filter.clone(),
            payload: None,
        }
    }
}

/// Explicit codec registry for durable subfeed records, keyed by kind.
///
/// Kept as a registry (rather than matching inline at the call sites) so
/// embedders can register additional kinds alongside the built-in ones.
pub struct SubFeedCodecRegistry {
    codecs: BTreeMap<SubFeedKind, SubFeedCodec>,
}

/// Encode/decode functions for one subfeed kind.
pub struct SubFeedCodec {
    pub encode: fn(&SubFeed) -> Value,
    pub decode: fn(&Value) -> Result<SubFeed, serde_json::Error>,
}

fn encode_record(subfeed: &SubFeed) -> Value {
    serde_json::to_value(SubFeedRecord::from(subfeed)).unwrap_or(Value::Null)
}

fn decode_record(value: &Value) -> Result<SubFeed, serde_json::Error> {
    let record: SubFeedRecord = serde_json::from_value(value.clone())?;
    Ok(record.to_subfeed())
}

impl SubFeedCodecRegistry {
    /// Registry with the built-in kinds registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut codecs = BTreeMap::new();
        for kind in [SubFeedKind::Generic, SubFeedKind::Frame] {
            codecs.insert(
                kind,
                SubFeedCodec {
                    encode: encode_record,
                    decode: decode_record,
                },
            );
        }
        Self { codecs }
    }

    /// Register or replace the codec for a kind.
    pub fn register(&mut self, kind: SubFeedKind, codec: SubFeedCodec) {
        self.codecs.insert(kind, codec);
    }

    /// Codec for a kind, if registered.
    #[must_use]
    pub fn get(&self, kind: SubFeedKind) -> Option<&SubFeedCodec> {
        self.codecs.get(&kind)
    }
}

impl Default for SubFeedCodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pv(pairs: &[(&str, &str)]) -> PartitionValues {
        PartitionValues::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn project_drops_foreign_keys_and_empty_records() {
        let subfeed = SubFeed {
            data_object_id: "tgt".into(),
            partition_values: vec![
                pv(&[("dt", "20180101"), ("type", "person")]),
                pv(&[("region", "eu")]),
            ],
            ..SubFeed::default()
        };
        let projected = subfeed.project(&["dt"]);
        assert_eq!(projected.partition_values, vec![pv(&[("dt", "20180101")])]);
    }

    #[test]
    fn project_collapses_duplicates() {
        let subfeed = SubFeed {
            data_object_id: "tgt".into(),
            partition_values: vec![
                pv(&[("dt", "20180101"), ("type", "person")]),
                pv(&[("dt", "20180101"), ("type", "company")]),
            ],
            ..SubFeed::default()
        };
        assert_eq!(subfeed.project(&["dt"]).partition_values.len(), 1);
    }

    #[test]
    fn with_selection_drops_payload() {
        let subfeed = SubFeed {
            data_object_id: "src".into(),
            payload: Some(DataFrame::from_rows(vec![json!({"a": 1})])),
            ..SubFeed::default()
        };
        let selected =
            subfeed.with_selection(vec![pv(&[("dt", "20180101")])], Some("rating > 4".into()));
        assert!(selected.payload.is_none());
        assert_eq!(selected.filter.as_deref(), Some("rating > 4"));
        assert_eq!(selected.partition_values.len(), 1);
    }

    #[test]
    fn as_skipped_clears_selection_and_filter() {
        let subfeed = SubFeed {
            data_object_id: "src".into(),
            partition_values: vec![pv(&[("dt", "20180101")])],
            filter: Some("rating > 4".into()),
            ..SubFeed::default()
        };
        let skipped = subfeed.as_skipped();
        assert!(skipped.is_skipped);
        assert!(skipped.partition_values.is_empty());
        assert!(skipped.filter.is_none());
    }

    #[test]
    fn break_lineage_drops_payload_only() {
        let subfeed = SubFeed {
            data_object_id: "src".into(),
            partition_values: vec![pv(&[("dt", "20180101")])],
            payload: Some(DataFrame::from_rows(vec![json!({"a": 1})])),
            ..SubFeed::default()
        };
        let broken = subfeed.break_lineage();
        assert!(broken.payload.is_none());
        assert_eq!(broken.partition_values, subfeed.partition_values);
    }

    #[test]
    fn dag_start_marker_roundtrip() {
        let subfeed = SubFeed::dag_start("src".into(), vec![pv(&[("dt", "20180101")])]);
        assert!(subfeed.is_dag_start);
        assert!(!subfeed.cleared_dag_start().is_dag_start);
    }

    #[test]
    fn record_conversion_drops_payload_and_tags_kind() {
        let subfeed = SubFeed {
            data_object_id: "src".into(),
            payload: Some(DataFrame::from_rows(vec![json!({"a": 1})])),
            ..SubFeed::default()
        };
        let record = SubFeedRecord::from(&subfeed);
        assert_eq!(record.kind, SubFeedKind::Frame);
        assert!(record.to_subfeed().payload.is_none());

        let no_payload = SubFeed::new("src".into());
        assert_eq!(SubFeedRecord::from(&no_payload).kind, SubFeedKind::Generic);
    }

    #[test]
    fn record_preserves_unknown_fields_on_roundtrip() {
        let raw = json!({
            "kind": "generic",
            "data_object_id": "src",
            "partition_values": [{"dt": "20180101"}],
            "future_field": {"nested": true}
        });
        let record: SubFeedRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.extra["future_field"], json!({"nested": true}));
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["future_field"], raw["future_field"]);
    }

    #[test]
    fn codec_registry_roundtrip() {
        let registry = SubFeedCodecRegistry::with_builtins();
        let subfeed = SubFeed {
            data_object_id: "src".into(),
            partition_values: vec![pv(&[("dt", "20180101")])],
            filter: Some("rating > 4".into()),
            ..SubFeed::default()
        };
        let codec = registry.get(SubFeedKind::Generic).unwrap();
        let encoded = (codec.encode)(&subfeed);
        let decoded = (codec.decode)(&encoded).unwrap();
        assert_eq!(decoded.data_object_id, subfeed.data_object_id);
        assert_eq!(decoded.partition_values, subfeed.partition_values);
        assert_eq!(decoded.filter, subfeed.filter);
    }
}

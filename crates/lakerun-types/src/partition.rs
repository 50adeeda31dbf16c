//! Partition-value algebra.
//!
//! A [`PartitionValues`] maps partition-column names to string values, e.g.
//! `dt=20180101/type=person`. Planners and execution modes produce them,
//! actions transform them, and they flow along DAG edges inside subfeeds.
//! They are value types: every operation returns a new instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mapping of partition-column name to string value.
///
/// Backed by a `BTreeMap` so key order (and therefore `Display` and serde
/// output) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionValues {
    elements: BTreeMap<String, String>,
}

impl PartitionValues {
    /// Create an empty partition-value record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs.
    #[must_use]
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            elements: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Single-column record.
    #[must_use]
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_pairs([(key.into(), value.into())])
    }

    /// Partition-column names present in this record.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.elements.keys().map(String::as_str).collect()
    }

    /// Value for a partition column, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.elements.get(key).map(String::as_str)
    }

    /// True if no columns are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of partition columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Iterate over (column, value) pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.elements
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Project onto the given columns, dropping all other keys.
    #[must_use]
    pub fn project<S: AsRef<str>>(&self, columns: &[S]) -> Self {
        let keep: Vec<&str> = columns.iter().map(AsRef::as_ref).collect();
        Self {
            elements: self
                .elements
                .iter()
                .filter(|(k, _)| keep.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Subset test on the columns shared with `other`: true if every column
    /// of `self` is present in `other` with the same value.
    #[must_use]
    pub fn is_included_in(&self, other: &Self) -> bool {
        self.elements
            .iter()
            .all(|(k, v)| other.elements.get(k) == Some(v))
    }

    /// JSON object exposing the elements to expression evaluation.
    #[must_use]
    pub fn expr_context(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.elements
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }
}

impl std::fmt::Display for PartitionValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.elements {
            if !first {
                f.write_str("/")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Set difference `left \ right`, compared after projecting both sides onto
/// `columns`. Duplicates introduced by the projection are collapsed; the
/// result preserves the order of `left`.
#[must_use]
pub fn diff<S: AsRef<str>>(
    left: &[PartitionValues],
    right: &[PartitionValues],
    columns: &[S],
) -> Vec<PartitionValues> {
    let right_projected: Vec<PartitionValues> =
        right.iter().map(|pv| pv.project(columns)).collect();
    let mut seen: Vec<PartitionValues> = Vec::new();
    let mut result = Vec::new();
    for pv in left {
        let projected = pv.project(columns);
        if projected.is_empty() {
            continue;
        }
        if !right_projected.contains(&projected) && !seen.contains(&projected) {
            seen.push(projected.clone());
            result.push(projected);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv(pairs: &[(&str, &str)]) -> PartitionValues {
        PartitionValues::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn keys_are_sorted() {
        let v = pv(&[("type", "person"), ("dt", "20180101")]);
        assert_eq!(v.keys(), vec!["dt", "type"]);
    }

    #[test]
    fn display_is_path_like() {
        let v = pv(&[("dt", "20180101"), ("type", "person")]);
        assert_eq!(v.to_string(), "dt=20180101/type=person");
    }

    #[test]
    fn project_drops_extra_keys() {
        let v = pv(&[("dt", "20180101"), ("type", "person")]);
        let projected = v.project(&["dt"]);
        assert_eq!(projected, pv(&[("dt", "20180101")]));
    }

    #[test]
    fn project_onto_missing_columns_is_empty() {
        let v = pv(&[("dt", "20180101")]);
        assert!(v.project(&["region"]).is_empty());
    }

    #[test]
    fn is_included_in_subset() {
        let small = pv(&[("dt", "20180101")]);
        let big = pv(&[("dt", "20180101"), ("type", "person")]);
        assert!(small.is_included_in(&big));
        assert!(!big.is_included_in(&small));
    }

    #[test]
    fn is_included_in_requires_equal_values() {
        let a = pv(&[("dt", "20180101")]);
        let b = pv(&[("dt", "20190101")]);
        assert!(!a.is_included_in(&b));
    }

    #[test]
    fn empty_is_included_in_everything() {
        let empty = PartitionValues::new();
        assert!(empty.is_included_in(&pv(&[("dt", "x")])));
    }

    #[test]
    fn diff_restricted_to_first_column() {
        let left = vec![
            pv(&[("dt", "20180101"), ("type", "person")]),
            pv(&[("dt", "20190101"), ("type", "company")]),
        ];
        let right = vec![pv(&[("dt", "20180101")])];
        let d = diff(&left, &right, &["dt"]);
        assert_eq!(d, vec![pv(&[("dt", "20190101")])]);
    }

    #[test]
    fn diff_collapses_duplicates_after_projection() {
        let left = vec![
            pv(&[("dt", "20180101"), ("type", "person")]),
            pv(&[("dt", "20180101"), ("type", "company")]),
        ];
        let d = diff(&left, &[], &["dt"]);
        assert_eq!(d, vec![pv(&[("dt", "20180101")])]);
    }

    #[test]
    fn diff_with_empty_right_keeps_all() {
        let left = vec![pv(&[("dt", "a")]), pv(&[("dt", "b")])];
        let d = diff(&left, &[], &["dt"]);
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn serde_roundtrip() {
        let v = pv(&[("dt", "20180101"), ("type", "person")]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"dt":"20180101","type":"person"}"#);
        let back: PartitionValues = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn expr_context_exposes_elements() {
        let v = pv(&[("dt", "20180101")]);
        let ctx = v.expr_context();
        assert_eq!(ctx["dt"], "20180101");
    }
}

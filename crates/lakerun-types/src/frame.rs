//! In-memory data frame.
//!
//! The orchestrator core never performs data I/O itself; it passes an
//! engine handle between actions inside subfeeds. [`DataFrame`] is that
//! handle: a column-named collection of JSON rows with just enough
//! relational surface (partition filter, row predicate, union, max) for
//! execution modes and transformers to do their work.

use serde_json::Value;

use crate::expression::{self, ExprError, ExpressionContext};
use crate::partition::PartitionValues;

/// Rows as JSON objects plus the declared column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    columns: Vec<String>,
    rows: Vec<Value>,
}

impl DataFrame {
    /// Empty frame with the given columns.
    #[must_use]
    pub fn empty<S: Into<String>, I: IntoIterator<Item = S>>(columns: I) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Build from JSON object rows. Columns are taken from the first row's
    /// keys when not supplied explicitly.
    #[must_use]
    pub fn from_rows(rows: Vec<Value>) -> Self {
        let columns = rows
            .first()
            .and_then(Value::as_object)
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        Self { columns, rows }
    }

    /// Declared column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Borrow the rows.
    #[must_use]
    pub fn rows(&self) -> &[Value] {
        &self.rows
    }

    /// Consume the frame, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Value> {
        self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// True if the frame has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep rows matching any of the given partition-value records. An
    /// empty selection keeps everything (no filter).
    #[must_use]
    pub fn filter_partition_values(&self, partition_values: &[PartitionValues]) -> Self {
        if partition_values.is_empty() {
            return self.clone();
        }
        let rows = self
            .rows
            .iter()
            .filter(|row| {
                partition_values.iter().any(|pv| {
                    pv.iter()
                        .all(|(col, val)| row_value_str(row, col).as_deref() == Some(val))
                })
            })
            .cloned()
            .collect();
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Keep rows for which the predicate expression evaluates true. Each
    /// row's fields are bound at the top level of the evaluation context.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError`] if the predicate does not parse or does not
    /// evaluate to a boolean for some row.
    pub fn filter_expr(&self, predicate: &str) -> Result<Self, ExprError> {
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let ctx = ExpressionContext::new().with_object(row);
            if expression::evaluate_bool(predicate, &ctx)? {
                rows.push(row.clone());
            }
        }
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Concatenate two frames. Columns are taken from `self` unless empty.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let columns = if self.columns.is_empty() {
            other.columns.clone()
        } else {
            self.columns.clone()
        };
        let mut rows = self.rows.clone();
        rows.extend(other.rows.iter().cloned());
        Self { columns, rows }
    }

    /// Maximum value of a column rendered as a string; numeric when every
    /// value parses as a number, lexicographic otherwise. `None` for an
    /// empty frame or an absent column.
    #[must_use]
    pub fn max_str(&self, column: &str) -> Option<String> {
        let values: Vec<String> = self
            .rows
            .iter()
            .filter_map(|row| row_value_str(row, column))
            .collect();
        if values.is_empty() {
            return None;
        }
        let all_numeric = values.iter().all(|v| v.parse::<f64>().is_ok());
        if all_numeric {
            values
                .into_iter()
                .max_by(|a, b| {
                    let (a, b): (f64, f64) = (a.parse().unwrap_or(f64::MIN), b.parse().unwrap_or(f64::MIN));
                    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
                })
        } else {
            values.into_iter().max()
        }
    }

    /// Distinct partition-value records present in the frame for the given
    /// partition columns.
    #[must_use]
    pub fn partition_values<S: AsRef<str>>(&self, columns: &[S]) -> Vec<PartitionValues> {
        let mut seen = Vec::new();
        for row in &self.rows {
            let pv = PartitionValues::from_pairs(columns.iter().filter_map(|col| {
                row_value_str(row, col.as_ref()).map(|v| (col.as_ref().to_string(), v))
            }));
            if !pv.is_empty() && !seen.contains(&pv) {
                seen.push(pv);
            }
        }
        seen
    }
}

fn row_value_str(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ratings() -> DataFrame {
        DataFrame::from_rows(vec![
            json!({"dt": "20180101", "type": "person", "rating": 5}),
            json!({"dt": "20190101", "type": "company", "rating": 10}),
        ])
    }

    #[test]
    fn from_rows_takes_columns_from_first_row() {
        let df = ratings();
        assert_eq!(df.num_rows(), 2);
        assert!(df.columns().contains(&"rating".to_string()));
    }

    #[test]
    fn filter_partition_values_selects_matching_rows() {
        let df = ratings();
        let filtered =
            df.filter_partition_values(&[PartitionValues::single("dt", "20180101")]);
        assert_eq!(filtered.num_rows(), 1);
        assert_eq!(filtered.rows()[0]["rating"], 5);
    }

    #[test]
    fn filter_partition_values_empty_selection_keeps_all() {
        let df = ratings();
        assert_eq!(df.filter_partition_values(&[]).num_rows(), 2);
    }

    #[test]
    fn filter_partition_values_multi_column() {
        let df = ratings();
        let pv = PartitionValues::from_pairs([("dt", "20190101"), ("type", "company")]);
        let filtered = df.filter_partition_values(&[pv]);
        assert_eq!(filtered.num_rows(), 1);
        assert_eq!(filtered.rows()[0]["rating"], 10);
    }

    #[test]
    fn filter_expr_applies_row_predicate() {
        let df = ratings();
        let filtered = df.filter_expr("rating > 6").unwrap();
        assert_eq!(filtered.num_rows(), 1);
        assert_eq!(filtered.rows()[0]["type"], "company");
    }

    #[test]
    fn union_concatenates_rows() {
        let df = ratings();
        let more = DataFrame::from_rows(vec![json!({"dt": "20200101", "rating": 1})]);
        assert_eq!(df.union(&more).num_rows(), 3);
    }

    #[test]
    fn max_str_numeric_comparison() {
        let df = ratings();
        assert_eq!(df.max_str("rating").as_deref(), Some("10"));
    }

    #[test]
    fn max_str_lexicographic_for_strings() {
        let df = ratings();
        assert_eq!(df.max_str("type").as_deref(), Some("person"));
    }

    #[test]
    fn max_str_none_for_empty_or_missing() {
        let df = DataFrame::empty(["a"]);
        assert_eq!(df.max_str("a"), None);
        assert_eq!(ratings().max_str("no_such_col"), None);
    }

    #[test]
    fn partition_values_distinct_records() {
        let df = ratings();
        let pvs = df.partition_values(&["dt"]);
        assert_eq!(
            pvs,
            vec![
                PartitionValues::single("dt", "20180101"),
                PartitionValues::single("dt", "20190101"),
            ]
        );
    }
}

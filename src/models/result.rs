//! Result containers.
//!
//! Transports hand back a [`RawResult`]; only providers turn it into the
//! [`QueryResult`] callers see, so every source yields the same shape.

use crate::error::{DataResult, DataRetrievalError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// String-keyed metadata attached to results.
pub type Metadata = BTreeMap<String, JsonValue>;

/// Transport output before hooks run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub records: Vec<JsonValue>,
    pub metadata: Metadata,
    /// Total reported by the source (e.g. pagination total), when it differs
    /// from the number of records returned.
    pub total_count: Option<u64>,
    /// The source delivered only part of what was asked for.
    pub partial: bool,
}

impl RawResult {
    pub fn new(records: Vec<JsonValue>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// A result with no records, used by statements that return no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_total_count(mut self, total: u64) -> Self {
        self.total_count = Some(total);
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }
}

/// Immutable outcome of a completed fetch or execute.
///
/// `succeeded == true` with no records is a valid "no rows" answer; it is
/// not a failure. Records cannot be modified once the result exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    data: Vec<JsonValue>,
    #[serde(default)]
    metadata: Metadata,
    succeeded: bool,
    total_count: u64,
}

impl QueryResult {
    /// Build the caller-facing result from a transformed transport result.
    pub(crate) fn from_raw(raw: RawResult, extra: Metadata) -> Self {
        let total_count = raw.total_count.unwrap_or(raw.records.len() as u64);
        let mut metadata = raw.metadata;
        metadata.extend(extra);
        Self {
            data: raw.records,
            metadata,
            succeeded: !raw.partial,
            total_count,
        }
    }

    pub fn data(&self) -> &[JsonValue] {
        &self.data
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up one metadata entry.
    pub fn meta(&self, key: &str) -> Option<&JsonValue> {
        self.metadata.get(key)
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Total reported by the source; equals `len()` unless the source paginates.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn first(&self) -> Option<&JsonValue> {
        self.data.first()
    }

    pub fn into_data(self) -> Vec<JsonValue> {
        self.data
    }

    /// Deserialize every record into `T`.
    pub fn records_as<T: DeserializeOwned>(&self) -> DataResult<Vec<T>> {
        self.data
            .iter()
            .map(|record| {
                T::deserialize(record).map_err(|e| {
                    DataRetrievalError::query_with("record does not match the requested shape", e)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_result_is_success() {
        let result = QueryResult::from_raw(RawResult::empty(), Metadata::new());
        assert!(result.succeeded());
        assert!(result.is_empty());
        assert_eq!(result.total_count(), 0);
    }

    #[test]
    fn test_partial_marks_failure() {
        let raw = RawResult::new(vec![json!(1)]).partial();
        let result = QueryResult::from_raw(raw, Metadata::new());
        assert!(!result.succeeded());
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_total_count_prefers_source_total() {
        let raw = RawResult::new(vec![json!({"id": 1}), json!({"id": 2})]).with_total_count(40);
        let result = QueryResult::from_raw(raw, Metadata::new());
        assert_eq!(result.len(), 2);
        assert_eq!(result.total_count(), 40);
    }

    #[test]
    fn test_extra_metadata_is_merged() {
        let raw = RawResult::new(vec![]).with_metadata("row_count", 0);
        let mut extra = Metadata::new();
        extra.insert("retries".into(), json!(2));
        let result = QueryResult::from_raw(raw, extra);
        assert_eq!(result.meta("row_count"), Some(&json!(0)));
        assert_eq!(result.meta("retries"), Some(&json!(2)));
    }

    #[test]
    fn test_records_as() {
        #[derive(Deserialize)]
        struct User {
            id: i64,
            name: String,
        }

        let raw = RawResult::new(vec![json!({"id": 7, "name": "ada"})]);
        let result = QueryResult::from_raw(raw, Metadata::new());
        let users: Vec<User> = result.records_as().unwrap();
        assert_eq!(users[0].id, 7);
        assert_eq!(users[0].name, "ada");

        let bad: DataResult<Vec<User>> =
            QueryResult::from_raw(RawResult::new(vec![json!("x")]), Metadata::new()).records_as();
        assert!(bad.is_err());
    }
}

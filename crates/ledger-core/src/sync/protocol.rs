//! Delta-sync wire contract

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Table;

/// Default number of changed records requested per pull batch
pub const DEFAULT_PULL_LIMIT: u32 = 500;

/// "Changes since version V" for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRequest {
    pub table: Table,
    pub since_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl DeltaRequest {
    pub const fn new(table: Table, since_version: i64) -> Self {
        Self {
            table,
            since_version,
            limit: None,
        }
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Changed records above the requested watermark.
///
/// `deleted` carries tombstones, not ids, so they can be applied like any
/// other row. `current_server_version` is the watermark to store once the
/// batch is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse<T> {
    #[serde(default = "Vec::new")]
    pub created: Vec<T>,
    #[serde(default = "Vec::new")]
    pub updated: Vec<T>,
    #[serde(default = "Vec::new")]
    pub deleted: Vec<T>,
    pub current_server_version: i64,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> DeltaResponse<T> {
    /// An empty delta at the given server version
    pub const fn empty(current_server_version: i64) -> Self {
        Self {
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            current_server_version,
            has_more: false,
        }
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in apply order: created, updated, then tombstones
    pub fn into_records(self) -> impl Iterator<Item = T> {
        self.created
            .into_iter()
            .chain(self.updated)
            .chain(self.deleted)
    }

    /// Convert every record, failing on the first one that does not convert
    pub fn try_map<U>(self, mut convert: impl FnMut(T) -> Result<U>) -> Result<DeltaResponse<U>> {
        let mut map_all = |records: Vec<T>| records.into_iter().map(&mut convert).collect::<Result<Vec<_>>>();
        Ok(DeltaResponse {
            created: map_all(self.created)?,
            updated: map_all(self.updated)?,
            deleted: map_all(self.deleted)?,
            current_server_version: self.current_server_version,
            has_more: self.has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_on_the_wire() {
        let request = DeltaRequest::new(Table::InboxItems, 17).with_limit(50);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"table": "inbox_items", "sinceVersion": 17, "limit": 50})
        );
    }

    #[test]
    fn response_defaults_missing_lists() {
        let response: DeltaResponse<serde_json::Value> =
            serde_json::from_value(json!({"currentServerVersion": 9})).unwrap();
        assert!(response.is_empty());
        assert!(!response.has_more);
        assert_eq!(response.current_server_version, 9);
    }

    #[test]
    fn records_come_out_in_apply_order() {
        let response = DeltaResponse {
            created: vec![1],
            updated: vec![2, 3],
            deleted: vec![4],
            current_server_version: 4,
            has_more: false,
        };
        assert_eq!(response.len(), 4);
        assert_eq!(response.into_records().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn try_map_stops_at_first_failure() {
        let response = DeltaResponse {
            created: vec!["1".to_string()],
            updated: vec!["x".to_string()],
            deleted: Vec::new(),
            current_server_version: 2,
            has_more: true,
        };
        let parsed = response.clone().try_map(|raw| {
            raw.parse::<i64>()
                .map_err(|error| crate::Error::InvalidInput(error.to_string()))
        });
        assert!(parsed.is_err());

        let lengths = response.try_map(|raw| Ok(raw.len())).unwrap();
        assert_eq!(lengths.updated, vec![1]);
        assert!(lengths.has_more);
    }
}

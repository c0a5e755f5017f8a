//! Reusable query predicates for syncable tables.
//!
//! Every default query is built from [`Query::active`], which applies the
//! tombstone filter. Sync paths opt into tombstones explicitly.

use libsql::Value;
use serde_json::Value as JsonValue;

use crate::models::{EntityId, SyncStatus};

/// Mint the id for a record about to be written for the first time.
///
/// This is the only place ids are generated. The repository layer calls it
/// immediately before the first write, so the local and remote copies share
/// the same id.
pub fn new_entity_id() -> EntityId {
    EntityId::generate()
}

/// A single predicate over a syncable table
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `deleted_at IS NULL`
    Active,
    /// `deleted_at IS NOT NULL`
    Tombstoned,
    /// Exact match on `local_sync_status`
    Status(SyncStatus),
    /// `version > watermark`, served by the version index
    VersionAfter(i64),
    /// `column = value`
    Eq(&'static str, JsonValue),
}

impl Filter {
    pub fn pending() -> Self {
        Self::Status(SyncStatus::Pending)
    }

    pub fn conflict() -> Self {
        Self::Status(SyncStatus::Conflict)
    }

    /// Foreign-key lookup helper
    pub fn references(column: &'static str, id: EntityId) -> Self {
        Self::Eq(column, JsonValue::String(id.as_str()))
    }

    fn push_sql(&self, clauses: &mut Vec<String>, params: &mut Vec<Value>) {
        match self {
            Self::Active => clauses.push("deleted_at IS NULL".to_string()),
            Self::Tombstoned => clauses.push("deleted_at IS NOT NULL".to_string()),
            Self::Status(status) => {
                clauses.push("local_sync_status = ?".to_string());
                params.push(Value::Text(status.as_str().to_string()));
            }
            Self::VersionAfter(version) => {
                clauses.push("version > ?".to_string());
                params.push(Value::Integer(*version));
            }
            Self::Eq(column, value) => {
                clauses.push(format!("{column} = ?"));
                params.push(json_to_sql(value));
            }
        }
    }
}

/// Sort order for list queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Most recently edited first
    #[default]
    UpdatedDesc,
    /// Ascending version, the order delta batches are applied in
    VersionAsc,
}

impl Order {
    const fn sql(self) -> &'static str {
        match self {
            Self::UpdatedDesc => "updated_at DESC",
            Self::VersionAsc => "version ASC",
        }
    }
}

/// Composable `WHERE` / `ORDER BY` / `LIMIT` for syncable tables
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Order,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Query {
    /// Default query: active records only
    pub fn active() -> Self {
        Self::unfiltered().with(Filter::Active)
    }

    /// Tombstoned records only
    pub fn tombstones() -> Self {
        Self::unfiltered().with(Filter::Tombstoned)
    }

    /// Records changed remotely after `watermark`, tombstones included
    pub fn delta(watermark: i64) -> Self {
        Self::unfiltered()
            .with(Filter::VersionAfter(watermark))
            .order_by(Order::VersionAsc)
    }

    /// No predicates at all; sync and cleanup paths only
    pub const fn unfiltered() -> Self {
        Self {
            filters: Vec::new(),
            order: Order::UpdatedDesc,
            limit: None,
            offset: 0,
        }
    }

    #[must_use]
    pub fn with(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub const fn order_by(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Render the `WHERE` clause (without the keyword) and its parameters
    pub fn where_sql(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::with_capacity(self.filters.len());
        let mut params = Vec::new();
        for filter in &self.filters {
            filter.push_sql(&mut clauses, &mut params);
        }

        if clauses.is_empty() {
            ("1 = 1".to_string(), params)
        } else {
            (clauses.join(" AND "), params)
        }
    }

    /// Render everything after `FROM table`
    pub fn tail_sql(&self) -> (String, Vec<Value>) {
        let (where_sql, mut params) = self.where_sql();
        let mut sql = format!("WHERE {where_sql} ORDER BY {}", self.order.sql());
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            params.push(Value::Integer(i64::try_from(self.offset).unwrap_or(0)));
        }
        (sql, params)
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::active()
    }
}

/// Convert a JSON scalar into a storage value
pub fn json_to_sql(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(flag) => Value::Integer(i64::from(*flag)),
        JsonValue::Number(number) => number.as_i64().map_or_else(
            || Value::Real(number.as_f64().unwrap_or_default()),
            Value::Integer,
        ),
        JsonValue::String(text) => Value::Text(text.clone()),
        other => Value::Text(other.to_string()),
    }
}

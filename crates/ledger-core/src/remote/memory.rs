//! In-process authoritative backend.
//!
//! Holds one global version counter shared by every table, enforces
//! optimistic concurrency on writes and applies the same constraint checks
//! the hosted backend does (category hierarchy, dependents, duplicate names).
//! Several local stores can sync against one instance to model multiple
//! devices.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value as JsonValue};

use crate::db::{Filter, Order, Query};
use crate::models::{Currency, EntityId, SyncStatus, Table};
use crate::sync::{DeltaRequest, DeltaResponse, DEFAULT_PULL_LIMIT};
use crate::util::now_millis;

use super::{RemoteClient, RemoteError, RemoteResult};

type Record = Map<String, JsonValue>;

struct StoredRecord {
    record: Record,
    /// Server version at which the record was first written
    created_version: i64,
}

#[derive(Default)]
struct State {
    version: i64,
    tables: HashMap<Table, BTreeMap<EntityId, StoredRecord>>,
    currencies: Vec<Currency>,
    offline: bool,
    failing_writes: u32,
    corrupt_next_pull: Option<Table>,
}

/// Authoritative backend living in the current process
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Empty backend seeded with a few common currencies
    pub fn new() -> Self {
        let currencies = [
            ("EUR", "Euro", "€", 2),
            ("GBP", "Pound Sterling", "£", 2),
            ("JPY", "Yen", "¥", 0),
            ("USD", "US Dollar", "$", 2),
        ]
        .into_iter()
        .map(|(code, name, symbol, decimals)| Currency {
            code: code.to_string(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals,
        })
        .collect();

        Self {
            state: Mutex::new(State {
                currencies,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a network partition; every call fails while set
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make the next `count` writes fail as if the connection dropped
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    /// Append one undecodable record to the next delta served for `table`
    pub fn corrupt_next_pull(&self, table: Table) {
        self.lock().corrupt_next_pull = Some(table);
    }

    pub fn set_currencies(&self, currencies: Vec<Currency>) {
        self.lock().currencies = currencies;
    }

    /// Global version counter
    pub fn current_version(&self) -> i64 {
        self.lock().version
    }

    /// Stored copy of a record, tombstones included
    pub fn record(&self, table: Table, id: EntityId) -> Option<JsonValue> {
        self.lock()
            .tables
            .get(&table)
            .and_then(|records| records.get(&id))
            .map(|stored| JsonValue::Object(stored.record.clone()))
    }

    /// Number of stored records (tombstones included)
    pub fn record_count(&self, table: Table) -> usize {
        self.lock().tables.get(&table).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn fetch(&self, table: Table, id: EntityId) -> RemoteResult<Option<JsonValue>> {
        let state = self.lock();
        state.ensure_reachable()?;
        Ok(state
            .tables
            .get(&table)
            .and_then(|records| records.get(&id))
            .map(|stored| JsonValue::Object(stored.record.clone())))
    }

    async fn select(&self, table: Table, query: &Query) -> RemoteResult<Vec<JsonValue>> {
        let state = self.lock();
        state.ensure_reachable()?;
        Ok(state.select(table, query))
    }

    async fn write(
        &self,
        table: Table,
        record: JsonValue,
        expected_version: i64,
    ) -> RemoteResult<JsonValue> {
        self.lock().write(table, record, expected_version)
    }

    async fn changes_since(&self, request: &DeltaRequest) -> RemoteResult<DeltaResponse<JsonValue>> {
        self.lock().changes_since(request)
    }

    async fn rpc(&self, name: &str, args: JsonValue) -> RemoteResult<JsonValue> {
        let mut state = self.lock();
        state.ensure_reachable()?;
        match name {
            "merge_categories" => state.merge_categories(&args),
            other => Err(RemoteError::new(
                "PGRST202",
                format!("function {other} not found"),
            )),
        }
    }

    async fn list_currencies(&self) -> RemoteResult<Vec<Currency>> {
        let state = self.lock();
        state.ensure_reachable()?;
        Ok(state.currencies.clone())
    }
}

impl State {
    fn ensure_reachable(&self) -> RemoteResult<()> {
        if self.offline {
            Err(RemoteError::unreachable("remote unreachable"))
        } else {
            Ok(())
        }
    }

    fn records(&self, table: Table) -> impl Iterator<Item = (&EntityId, &Record)> {
        self.tables
            .get(&table)
            .into_iter()
            .flat_map(|records| records.iter().map(|(id, stored)| (id, &stored.record)))
    }

    fn active(&self, table: Table, id: EntityId) -> Option<&Record> {
        self.tables
            .get(&table)
            .and_then(|records| records.get(&id))
            .map(|stored| &stored.record)
            .filter(|record| is_active(record))
    }

    fn active_children(&self, category: EntityId) -> usize {
        self.records(Table::Categories)
            .filter(|(_, record)| is_active(record) && id_field(record, "parent_id") == Some(category))
            .count()
    }

    fn next_version(&mut self) -> i64 {
        self.version += 1;
        self.version
    }

    fn select(&self, table: Table, query: &Query) -> Vec<JsonValue> {
        let mut matched: Vec<&Record> = self
            .records(table)
            .map(|(_, record)| record)
            .filter(|record| query.filters.iter().all(|filter| matches(filter, record)))
            .collect();

        match query.order {
            Order::UpdatedDesc => {
                matched.sort_by_key(|record| std::cmp::Reverse(int_field(record, "updated_at")));
            }
            Order::VersionAsc => matched.sort_by_key(|record| int_field(record, "version")),
        }

        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|record| JsonValue::Object(record.clone()))
            .collect()
    }

    fn write(
        &mut self,
        table: Table,
        record: JsonValue,
        expected_version: i64,
    ) -> RemoteResult<JsonValue> {
        self.ensure_reachable()?;
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(RemoteError::unreachable("connection reset"));
        }
        if !table.is_syncable() {
            return Err(RemoteError::new("22023", format!("{table} is read-only")));
        }
        let JsonValue::Object(mut record) = record else {
            return Err(RemoteError::new("22023", "record must be a JSON object"));
        };
        let id = id_field(&record, "id")
            .ok_or_else(|| RemoteError::new("22023", "record id is missing or invalid"))?;

        let existing = self.tables.get(&table).and_then(|records| records.get(&id));
        match (existing, expected_version) {
            (None, 0) => {}
            (None, _) => {
                return Err(RemoteError::new(
                    "PGRST116",
                    format!("{table}/{id} does not exist"),
                ));
            }
            (Some(stored), expected) => {
                let current = int_field(&stored.record, "version");
                if current != expected {
                    return Err(RemoteError::version_conflict(format!(
                        "{table}/{id}: expected version {expected}, server has {current}"
                    )));
                }
            }
        }
        let created_at = existing.map(|stored| int_field(&stored.record, "created_at"));
        let created_version = existing.map(|stored| stored.created_version);

        self.validate(table, id, &record)?;

        let now = now_millis();
        let version = self.next_version();
        record.insert("version".to_string(), version.into());
        let created_at = match created_at {
            Some(stored) if stored > 0 => stored,
            _ => match int_field(&record, "created_at") {
                0 => now,
                sent => sent,
            },
        };
        record.insert("created_at".to_string(), created_at.into());
        if int_field(&record, "updated_at") == 0 {
            record.insert("updated_at".to_string(), now.into());
        }

        self.tables.entry(table).or_default().insert(
            id,
            StoredRecord {
                record: record.clone(),
                created_version: created_version.unwrap_or(version),
            },
        );
        Ok(JsonValue::Object(record))
    }

    fn validate(&self, table: Table, id: EntityId, record: &Record) -> RemoteResult<()> {
        if !is_active(record) {
            return match table {
                Table::Categories => {
                    let children = self.active_children(id);
                    if children > 0 {
                        Err(RemoteError::new(
                            "HAS_DEPENDENTS",
                            format!("category has {children} active subcategories"),
                        )
                        .with_details(json!({ "child_count": children })))
                    } else {
                        Ok(())
                    }
                }
                _ => Ok(()),
            };
        }

        match table {
            Table::Accounts => {
                require_text(record, "name")?;
                self.require_currency(record)
            }
            Table::Categories => self.validate_category(id, record),
            Table::Transactions => {
                self.require_currency(record)?;
                let account = id_field(record, "account_id");
                if account.and_then(|account| self.active(Table::Accounts, account)).is_none() {
                    return Err(RemoteError::new("23514", "transaction account does not exist"));
                }
                Ok(())
            }
            Table::InboxItems => require_text(record, "description").map(|_| ()),
            Table::Currencies => Err(RemoteError::new("22023", "currencies are read-only")),
        }
    }

    fn require_currency(&self, record: &Record) -> RemoteResult<()> {
        static CODE: OnceLock<Option<Regex>> = OnceLock::new();
        let code = text_field(record, "currency_code").unwrap_or_default();
        let well_formed = CODE
            .get_or_init(|| Regex::new("^[A-Z]{3}$").ok())
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(code));
        if !well_formed {
            return Err(RemoteError::new(
                "23514",
                format!("invalid currency code '{code}'"),
            ));
        }
        if !self.currencies.iter().any(|currency| currency.code == code) {
            return Err(RemoteError::new("23514", format!("unknown currency '{code}'")));
        }
        Ok(())
    }

    fn validate_category(&self, id: EntityId, record: &Record) -> RemoteResult<()> {
        let name = require_text(record, "name")?;
        let parent = match record.get("parent_id") {
            None | Some(JsonValue::Null) => None,
            Some(_) => Some(
                id_field(record, "parent_id")
                    .ok_or_else(|| RemoteError::new("22023", "parent_id is not a valid id"))?,
            ),
        };

        if let Some(parent) = parent {
            if parent == id {
                return Err(RemoteError::new(
                    "HIERARCHY_VIOLATION",
                    "a category cannot be its own parent",
                ));
            }
            let parent_record = self.active(Table::Categories, parent).ok_or_else(|| {
                RemoteError::new("HIERARCHY_VIOLATION", "parent category does not exist")
            })?;
            if id_field(parent_record, "parent_id").is_some() {
                return Err(RemoteError::new(
                    "HIERARCHY_VIOLATION",
                    "categories nest only one level deep",
                ));
            }
            if self.active_children(id) > 0 {
                return Err(RemoteError::new(
                    "HIERARCHY_VIOLATION",
                    "a category with subcategories cannot be nested",
                ));
            }
        }

        let duplicate = self.records(Table::Categories).any(|(other_id, other)| {
            *other_id != id
                && is_active(other)
                && id_field(other, "parent_id") == parent
                && text_field(other, "name").is_some_and(|other| other.eq_ignore_ascii_case(name))
        });
        if duplicate {
            return Err(RemoteError::new(
                "23505",
                format!("category '{name}' already exists at this level"),
            ));
        }
        Ok(())
    }

    fn changes_since(&mut self, request: &DeltaRequest) -> RemoteResult<DeltaResponse<JsonValue>> {
        self.ensure_reachable()?;
        if !request.table.is_syncable() {
            return Err(RemoteError::new(
                "22023",
                format!("{} has no change feed", request.table),
            ));
        }

        let limit = usize::try_from(request.limit.unwrap_or(DEFAULT_PULL_LIMIT))
            .unwrap_or(usize::MAX)
            .max(1);
        let delta = Query::delta(request.since_version);
        let mut changed: Vec<&StoredRecord> = self
            .tables
            .get(&request.table)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|stored| delta.filters.iter().all(|filter| matches(filter, &stored.record)))
            .collect();
        changed.sort_by_key(|stored| int_field(&stored.record, "version"));

        let has_more = changed.len() > limit;
        changed.truncate(limit);

        let current_server_version = if has_more {
            changed
                .last()
                .map_or(self.version, |stored| int_field(&stored.record, "version"))
        } else {
            self.version
        };

        let mut response = DeltaResponse::empty(current_server_version);
        response.has_more = has_more;
        for stored in changed {
            let record = JsonValue::Object(stored.record.clone());
            if !is_active(&stored.record) {
                response.deleted.push(record);
            } else if stored.created_version > request.since_version {
                response.created.push(record);
            } else {
                response.updated.push(record);
            }
        }

        if self.corrupt_next_pull == Some(request.table) {
            self.corrupt_next_pull = None;
            response
                .updated
                .push(json!({ "id": "not-an-id", "version": current_server_version }));
        }
        Ok(response)
    }

    /// Fold `source_ids` into `target_id` in one step: reassign every
    /// transaction and inbox item, then tombstone the sources. Nothing is
    /// written unless every check passes.
    fn merge_categories(&mut self, args: &JsonValue) -> RemoteResult<JsonValue> {
        let target = args
            .get("target_id")
            .and_then(JsonValue::as_str)
            .and_then(|raw| raw.parse::<EntityId>().ok())
            .ok_or_else(|| RemoteError::new("22023", "target_id is required"))?;
        let sources = args
            .get("source_ids")
            .and_then(JsonValue::as_array)
            .map(|ids| {
                ids.iter()
                    .map(|raw| raw.as_str().and_then(|raw| raw.parse::<EntityId>().ok()))
                    .collect::<Option<Vec<_>>>()
            })
            .and_then(|ids| ids.filter(|ids| !ids.is_empty()))
            .ok_or_else(|| RemoteError::new("22023", "source_ids must be a non-empty id list"))?;

        if sources.contains(&target) {
            return Err(RemoteError::new(
                "22023",
                "a category cannot be merged into itself",
            ));
        }
        for category in sources.iter().chain(std::iter::once(&target)) {
            if self.active(Table::Categories, *category).is_none() {
                return Err(RemoteError::new(
                    "PGRST116",
                    format!("category {category} does not exist"),
                ));
            }
        }
        for source in &sources {
            let children = self.active_children(*source);
            if children > 0 {
                return Err(RemoteError::new(
                    "HAS_DEPENDENTS",
                    format!("category {source} has {children} active subcategories"),
                )
                .with_details(json!({ "child_count": children })));
            }
        }

        let now = now_millis();
        let State {
            version, tables, ..
        } = &mut *self;
        let target_value = JsonValue::String(target.as_str());
        let mut reassigned = 0_u64;

        for table in [Table::Transactions, Table::InboxItems] {
            for stored in tables.entry(table).or_default().values_mut() {
                let record = &mut stored.record;
                let points_at_source = id_field(record, "category_id")
                    .is_some_and(|category| sources.contains(&category));
                if is_active(record) && points_at_source {
                    *version += 1;
                    record.insert("category_id".to_string(), target_value.clone());
                    record.insert("version".to_string(), (*version).into());
                    record.insert("updated_at".to_string(), now.into());
                    reassigned += 1;
                }
            }
        }

        let categories = tables.entry(Table::Categories).or_default();
        for source in &sources {
            if let Some(stored) = categories.get_mut(source) {
                *version += 1;
                stored.record.insert("deleted_at".to_string(), now.into());
                stored.record.insert("version".to_string(), (*version).into());
                stored.record.insert("updated_at".to_string(), now.into());
            }
        }

        Ok(json!({
            "merged": sources.len(),
            "reassigned": reassigned,
            "version": self.version,
        }))
    }
}

fn matches(filter: &Filter, record: &Record) -> bool {
    match filter {
        Filter::Active => is_active(record),
        Filter::Tombstoned => !is_active(record),
        Filter::Status(status) => *status == SyncStatus::acknowledged(),
        Filter::VersionAfter(version) => int_field(record, "version") > *version,
        Filter::Eq(column, value) => record.get(*column) == Some(value),
    }
}

fn is_active(record: &Record) -> bool {
    record.get("deleted_at").map_or(true, JsonValue::is_null)
}

fn int_field(record: &Record, name: &str) -> i64 {
    record.get(name).and_then(JsonValue::as_i64).unwrap_or(0)
}

fn text_field<'a>(record: &'a Record, name: &str) -> Option<&'a str> {
    record.get(name).and_then(JsonValue::as_str)
}

fn id_field(record: &Record, name: &str) -> Option<EntityId> {
    text_field(record, name).and_then(|raw| raw.parse().ok())
}

fn require_text<'a>(record: &'a Record, name: &str) -> RemoteResult<&'a str> {
    text_field(record, name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| RemoteError::new("23514", format!("{name} must not be empty")))
}

//! Sync metadata carried by every syncable record, plus the row mapping
//! helpers entities use to bind themselves to storage.

use libsql::{Row, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

use super::{EntityId, Table};

/// Per-record sync lifecycle.
///
/// Every local mutation starts at `Pending`. Only a remote acknowledgment
/// moves it to `Synced` and only a version mismatch moves it to `Conflict`.
/// Nothing leaves `Conflict` automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }

    /// Status of a record that came from the remote authority
    pub const fn acknowledged() -> Self {
        Self::Synced
    }

    /// Whether an ordinary sync step may move from `self` to `next`.
    ///
    /// Local mutations restart the cycle at `Pending` and pushes settle it.
    /// Nothing here leaves `Conflict`; see [`Self::can_resolve_to`].
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Synced | Self::Pending, Self::Pending)
                | (Self::Pending, Self::Synced | Self::Conflict)
        )
    }

    /// Exits from `Conflict`, allowed only through an explicit resolution
    pub const fn can_resolve_to(self, next: Self) -> bool {
        matches!((self, next), (Self::Conflict, Self::Pending | Self::Synced))
    }

    /// Check a move, resolving or not, and name the record when it is refused
    pub fn ensure_transition(
        self,
        next: Self,
        resolving: bool,
        record: impl fmt::Display,
    ) -> Result<()> {
        let allowed = if resolving {
            self.can_resolve_to(next)
        } else {
            self.can_transition_to(next)
        };
        if allowed {
            Ok(())
        } else if self == Self::Conflict {
            Err(Error::InvalidInput(format!(
                "{record} is in conflict; resolve it before editing"
            )))
        } else {
            Err(Error::InvalidInput(format!(
                "{record} cannot move from {self} to {next}"
            )))
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::Database(format!("unknown sync status: {other}"))),
        }
    }
}

/// Metadata columns shared by every syncable table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Assigned by the repository before the first write, then immutable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    /// Last version acknowledged by the remote (0 = never)
    #[serde(default)]
    pub version: i64,
    /// Tombstone timestamp (Unix ms)
    #[serde(default)]
    pub deleted_at: Option<i64>,
    /// Local-only sync state
    #[serde(skip, default = "SyncStatus::acknowledged")]
    pub local_sync_status: SyncStatus,
    /// Server-reported reason for the last conflict (local-only)
    #[serde(skip)]
    pub sync_error: Option<String>,
    /// Creation timestamp (Unix ms)
    #[serde(default)]
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    #[serde(default)]
    pub updated_at: i64,
}

impl SyncMeta {
    /// Column order used by every syncable table, ahead of domain columns
    pub const COLUMNS: [&'static str; 7] = [
        "id",
        "version",
        "deleted_at",
        "local_sync_status",
        "sync_error",
        "created_at",
        "updated_at",
    ];

    /// Metadata for a record that has never been written anywhere
    #[must_use]
    pub const fn draft() -> Self {
        Self {
            id: None,
            version: 0,
            deleted_at: None,
            local_sync_status: SyncStatus::Pending,
            sync_error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// The record id, or an error for drafts that were never written
    pub fn require_id(&self) -> Result<EntityId> {
        self.id
            .ok_or_else(|| Error::InvalidInput("record has no id yet".into()))
    }

    pub const fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Read the metadata columns from the front of a row
    pub fn read(reader: &mut RowReader<'_>) -> Result<Self> {
        Ok(Self {
            id: Some(reader.id()?),
            version: reader.int()?,
            deleted_at: reader.opt_int()?,
            local_sync_status: reader.text()?.parse()?,
            sync_error: reader.opt_text()?,
            created_at: reader.int()?,
            updated_at: reader.int()?,
        })
    }

    /// Values for the metadata columns, in `COLUMNS` order
    pub fn to_values(&self) -> Result<Vec<Value>> {
        let id = self.require_id()?;
        Ok(vec![
            Value::Text(id.as_str()),
            Value::Integer(self.version),
            opt_int(self.deleted_at),
            Value::Text(self.local_sync_status.as_str().to_string()),
            opt_text(self.sync_error.as_deref()),
            Value::Integer(self.created_at),
            Value::Integer(self.updated_at),
        ])
    }
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self::draft()
    }
}

/// A record that participates in push/pull sync.
///
/// Storage binding is two pure functions: [`SyncEntity::to_values`] for
/// writes and [`SyncEntity::from_row`] for reads. Foreign keys are plain id
/// fields; repositories resolve them with lookups.
pub trait SyncEntity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Backing table
    const TABLE: Table;

    /// Domain columns in the order `to_values` produces and `from_row` reads
    const COLUMNS: &'static [&'static str];

    fn meta(&self) -> &SyncMeta;

    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Domain column values, excluding sync metadata
    fn to_values(&self) -> Result<Vec<Value>>;

    /// Build the record from domain columns, metadata already read
    fn from_row(reader: &mut RowReader<'_>, meta: SyncMeta) -> Result<Self>;

    fn id(&self) -> Option<EntityId> {
        self.meta().id
    }
}

/// Sequential column reader over a libSQL row
pub struct RowReader<'a> {
    row: &'a Row,
    index: i32,
}

impl<'a> RowReader<'a> {
    pub const fn new(row: &'a Row) -> Self {
        Self { row, index: 0 }
    }

    fn next_value(&mut self) -> Result<Value> {
        let value = self.row.get_value(self.index)?;
        self.index += 1;
        Ok(value)
    }

    fn column(&self) -> i32 {
        self.index - 1
    }

    pub fn int(&mut self) -> Result<i64> {
        match self.next_value()? {
            Value::Integer(value) => Ok(value),
            other => Err(self.unexpected("integer", &other)),
        }
    }

    pub fn opt_int(&mut self) -> Result<Option<i64>> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Integer(value) => Ok(Some(value)),
            other => Err(self.unexpected("integer or null", &other)),
        }
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.int()? != 0)
    }

    pub fn text(&mut self) -> Result<String> {
        match self.next_value()? {
            Value::Text(value) => Ok(value),
            other => Err(self.unexpected("text", &other)),
        }
    }

    pub fn opt_text(&mut self) -> Result<Option<String>> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Text(value) => Ok(Some(value)),
            other => Err(self.unexpected("text or null", &other)),
        }
    }

    pub fn id(&mut self) -> Result<EntityId> {
        let raw = self.text()?;
        raw.parse()
            .map_err(|_| Error::Database(format!("invalid id in column {}: {raw}", self.column())))
    }

    pub fn opt_id(&mut self) -> Result<Option<EntityId>> {
        self.opt_text()?
            .map(|raw| {
                raw.parse()
                    .map_err(|_| Error::Database(format!("invalid id: {raw}")))
            })
            .transpose()
    }

    /// Read a text column holding a serde unit-variant enum
    pub fn enumeration<T: DeserializeOwned>(&mut self) -> Result<T> {
        let raw = self.text()?;
        Ok(serde_json::from_str(&format!("\"{raw}\""))?)
    }

    fn unexpected(&self, expected: &str, found: &Value) -> Error {
        Error::Database(format!(
            "column {} expected {expected}, found {found:?}",
            self.column()
        ))
    }
}

/// Storage text for a serde unit-variant enum
pub fn enum_text<T: Serialize>(value: &T) -> Result<Value> {
    let json = serde_json::to_string(value)?;
    Ok(Value::Text(json.trim_matches('"').to_string()))
}

pub fn opt_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

pub fn opt_id(value: Option<EntityId>) -> Value {
    value.map_or(Value::Null, |id| Value::Text(id.as_str()))
}

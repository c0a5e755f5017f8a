//! Push outbox.
//!
//! One entry per record with unpushed local changes, written in the same
//! transaction as the local row. A crash between the local write and the
//! remote push therefore leaves a durable retry item instead of an orphaned
//! `pending` row.

use libsql::params::Params;
use libsql::{Connection, Row, Value};

use crate::error::{Error, Result};
use crate::models::{EntityId, RowReader, Table};

const ENTRY_COLUMNS: &str = "table_name, entity_id, revision, attempts, last_error, \
                             base_snapshot, enqueued_at, updated_at";

/// A queued push for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub table: Table,
    pub entity_id: EntityId,
    /// Bumped on every local mutation; a push only completes the revision it sent
    pub revision: i64,
    /// Failed push attempts so far
    pub attempts: i64,
    pub last_error: Option<String>,
    /// JSON of the last acknowledged row; `None` when there is no
    /// acknowledged state to fall back to
    pub base_snapshot: Option<String>,
    pub enqueued_at: i64,
    pub updated_at: i64,
}

impl OutboxEntry {
    fn from_row(row: &Row) -> Result<Self> {
        let mut reader = RowReader::new(row);
        Ok(Self {
            table: reader.text()?.parse()?,
            entity_id: reader.id()?,
            revision: reader.int()?,
            attempts: reader.int()?,
            last_error: reader.opt_text()?,
            base_snapshot: reader.opt_text()?,
            enqueued_at: reader.int()?,
            updated_at: reader.int()?,
        })
    }
}

/// Outbox storage over the local connection
pub struct OutboxRepository<'a> {
    conn: &'a Connection,
}

impl<'a> OutboxRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Queue a push, or bump the revision of an existing entry.
    ///
    /// The first snapshot wins: later edits before a successful push keep
    /// the original acknowledged state as the revert target.
    pub async fn enqueue(
        &self,
        table: Table,
        id: EntityId,
        base_snapshot: Option<String>,
        now: i64,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sync_outbox (table_name, entity_id, revision, attempts, base_snapshot, enqueued_at, updated_at)
                 VALUES (?, ?, 1, 0, ?, ?, ?)
                 ON CONFLICT(table_name, entity_id) DO UPDATE SET
                    revision = sync_outbox.revision + 1,
                    updated_at = excluded.updated_at",
                Params::Positional(vec![
                    Value::Text(table.name().to_string()),
                    Value::Text(id.as_str()),
                    base_snapshot.map_or(Value::Null, Value::Text),
                    Value::Integer(now),
                    Value::Integer(now),
                ]),
            )
            .await?;

        self.get(table, id)
            .await?
            .map(|entry| entry.revision)
            .ok_or_else(|| Error::Database(format!("outbox entry for {table}/{id} vanished")))
    }

    pub async fn get(&self, table: Table, id: EntityId) -> Result<Option<OutboxEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM sync_outbox WHERE table_name = ? AND entity_id = ?"
                ),
                [table.name().to_string(), id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(OutboxEntry::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Entries for one table, oldest first
    pub async fn list(&self, table: Table) -> Result<Vec<OutboxEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM sync_outbox WHERE table_name = ?
                     ORDER BY enqueued_at ASC, entity_id ASC"
                ),
                [table.name()],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(OutboxEntry::from_row(&row)?);
        }
        Ok(entries)
    }

    /// Remove the entry if no newer local edit arrived since `revision` was sent
    pub async fn complete(&self, table: Table, id: EntityId, revision: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM sync_outbox WHERE table_name = ? AND entity_id = ? AND revision = ?",
                Params::Positional(vec![
                    Value::Text(table.name().to_string()),
                    Value::Text(id.as_str()),
                    Value::Integer(revision),
                ]),
            )
            .await?;
        Ok(removed > 0)
    }

    /// Replace the revert target after the remote acknowledged an older
    /// revision of a record that is still queued
    pub async fn set_snapshot(&self, table: Table, id: EntityId, snapshot: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_outbox SET base_snapshot = ? WHERE table_name = ? AND entity_id = ?",
                [snapshot.to_string(), table.name().to_string(), id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Record a transient push failure; the entry stays queued
    pub async fn record_failure(
        &self,
        table: Table,
        id: EntityId,
        error: &str,
        now: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_outbox SET attempts = attempts + 1, last_error = ?, updated_at = ?
                 WHERE table_name = ? AND entity_id = ?",
                Params::Positional(vec![
                    Value::Text(error.to_string()),
                    Value::Integer(now),
                    Value::Text(table.name().to_string()),
                    Value::Text(id.as_str()),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Drop the entry unconditionally
    pub async fn remove(&self, table: Table, id: EntityId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_outbox WHERE table_name = ? AND entity_id = ?",
                [table.name().to_string(), id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Entries that must reach the remote before `entry`: anything queued
    /// for a parent table, plus older entries of the same table
    pub async fn count_ahead_of(&self, entry: &OutboxEntry, parents: &[Table]) -> Result<i64> {
        let mut params = vec![
            Value::Text(entry.table.name().to_string()),
            Value::Integer(entry.enqueued_at),
            Value::Integer(entry.enqueued_at),
            Value::Text(entry.entity_id.as_str()),
        ];
        let mut sql = "SELECT COUNT(*) FROM sync_outbox WHERE (table_name = ? AND \
                       (enqueued_at < ? OR (enqueued_at = ? AND entity_id < ?)))"
            .to_string();
        for parent in parents {
            sql.push_str(" OR table_name = ?");
            params.push(Value::Text(parent.name().to_string()));
        }

        let mut rows = self.conn.query(&sql, Params::Positional(params)).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }

    /// Number of queued pushes, for one table or all of them
    pub async fn count(&self, table: Option<Table>) -> Result<i64> {
        let mut rows = match table {
            Some(table) => {
                self.conn
                    .query(
                        "SELECT COUNT(*) FROM sync_outbox WHERE table_name = ?",
                        [table.name()],
                    )
                    .await?
            }
            None => self.conn.query("SELECT COUNT(*) FROM sync_outbox", ()).await?,
        };

        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }
}

//! Per-table sync watermarks

use libsql::params::Params;
use libsql::{Connection, Value};

use crate::error::Result;
use crate::models::{RowReader, SyncWatermark, Table};

/// Storage for `sync_metadata`, one row per syncable table
pub struct SyncMetadataRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SyncMetadataRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Current watermark; tables never pulled start at version 0
    pub async fn get(&self, table: Table) -> Result<SyncWatermark> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_synced_version, last_synced_at FROM sync_metadata WHERE table_name = ?",
                [table.name()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let mut reader = RowReader::new(&row);
                Ok(SyncWatermark {
                    table,
                    last_synced_version: reader.int()?,
                    last_synced_at: reader.opt_int()?,
                })
            }
            None => Ok(SyncWatermark::initial(table)),
        }
    }

    /// Advance the watermark. Never moves it backwards.
    ///
    /// Callers run this inside the transaction that applied the batch, so a
    /// crash mid-apply leaves the previous watermark in place.
    pub async fn advance(&self, table: Table, version: i64, now: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_metadata (table_name, last_synced_version, last_synced_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(table_name) DO UPDATE SET
                    last_synced_version = MAX(sync_metadata.last_synced_version, excluded.last_synced_version),
                    last_synced_at = excluded.last_synced_at",
                Params::Positional(vec![
                    Value::Text(table.name().to_string()),
                    Value::Integer(version),
                    Value::Integer(now),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Watermarks for every table, in `Table::ALL` order
    pub async fn list(&self) -> Result<Vec<SyncWatermark>> {
        let mut watermarks = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            watermarks.push(self.get(table).await?);
        }
        Ok(watermarks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_table_starts_at_zero() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = SyncMetadataRepository::new(db.connection());

        let watermark = repo.get(Table::Accounts).await.unwrap();
        assert_eq!(watermark, SyncWatermark::initial(Table::Accounts));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn advance_is_monotonic() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = SyncMetadataRepository::new(db.connection());

        repo.advance(Table::Categories, 12, 100).await.unwrap();
        repo.advance(Table::Categories, 7, 200).await.unwrap();

        let watermark = repo.get(Table::Categories).await.unwrap();
        assert_eq!(watermark.last_synced_version, 12);
        assert_eq!(watermark.last_synced_at, Some(200));

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), Table::ALL.len());
    }
}

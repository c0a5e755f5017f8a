//! Generic local repository for syncable tables.
//!
//! SQL is derived from `SyncMeta::COLUMNS` followed by the entity's own
//! `COLUMNS`, so every table shares one mapping path.

use std::marker::PhantomData;

use libsql::params::Params;
use libsql::{Connection, Row, Value};

use crate::error::{Error, Result};
use crate::models::{EntityId, RowReader, SyncConflict, SyncEntity, SyncMeta, SyncStatus};

use super::query::{Filter, Query};

/// libSQL storage for one syncable entity type
pub struct LocalRepository<'a, E> {
    conn: &'a Connection,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: SyncEntity> LocalRepository<'a, E> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            _entity: PhantomData,
        }
    }

    fn table() -> &'static str {
        E::TABLE.name()
    }

    fn columns() -> Vec<&'static str> {
        SyncMeta::COLUMNS
            .iter()
            .chain(E::COLUMNS.iter())
            .copied()
            .collect()
    }

    fn select_sql() -> String {
        format!("SELECT {} FROM {}", Self::columns().join(", "), Self::table())
    }

    fn upsert_sql() -> String {
        let columns = Self::columns();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates = columns
            .iter()
            .skip(1)
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {updates}",
            Self::table(),
            columns.join(", "),
        )
    }

    fn map_row(row: &Row) -> Result<E> {
        let mut reader = RowReader::new(row);
        let meta = SyncMeta::read(&mut reader)?;
        E::from_row(&mut reader, meta)
    }

    fn row_values(entity: &E) -> Result<Vec<Value>> {
        let mut values = entity.meta().to_values()?;
        values.extend(entity.to_values()?);
        Ok(values)
    }

    fn id_param(id: EntityId) -> Params {
        Params::Positional(vec![Value::Text(id.as_str())])
    }

    /// Active record by id
    pub async fn get(&self, id: EntityId) -> Result<Option<E>> {
        let query = Query::active().with(Filter::Eq("id", id.as_str().into()));
        Ok(self.list(&query).await?.into_iter().next())
    }

    /// Record by id, tombstoned or not
    pub async fn get_any(&self, id: EntityId) -> Result<Option<E>> {
        let query = Query::unfiltered().with(Filter::Eq("id", id.as_str().into()));
        Ok(self.list(&query).await?.into_iter().next())
    }

    pub async fn list(&self, query: &Query) -> Result<Vec<E>> {
        let (tail, params) = query.tail_sql();
        let mut rows = self
            .conn
            .query(
                &format!("{} {tail}", Self::select_sql()),
                Params::Positional(params),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::map_row(&row)?);
        }
        Ok(records)
    }

    pub async fn count(&self, query: &Query) -> Result<i64> {
        let (where_sql, params) = query.where_sql();
        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM {} WHERE {where_sql}", Self::table()),
                Params::Positional(params),
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }

    /// Insert or overwrite the whole row with the entity as given
    pub async fn upsert(&self, entity: &E) -> Result<()> {
        self.conn
            .execute(
                &Self::upsert_sql(),
                Params::Positional(Self::row_values(entity)?),
            )
            .await?;
        Ok(())
    }

    /// Apply a record received from the remote authority.
    ///
    /// The row is stored as `synced`. It is skipped when the local copy is
    /// already at a newer version, or is `pending`/`conflict` (an unpushed or
    /// unresolved local edit). Returns whether the row changed.
    pub async fn apply_remote(&self, mut entity: E) -> Result<bool> {
        {
            let meta = entity.meta_mut();
            meta.local_sync_status = SyncStatus::Synced;
            meta.sync_error = None;
        }

        let table = Self::table();
        let changed = self
            .conn
            .execute(
                &format!(
                    "{upsert}
                     WHERE excluded.version >= {table}.version
                       AND {table}.local_sync_status = 'synced'",
                    upsert = Self::upsert_sql(),
                ),
                Params::Positional(Self::row_values(&entity)?),
            )
            .await?;
        Ok(changed > 0)
    }

    /// Refuse a status move the state machine does not allow
    pub async fn check_transition(
        &self,
        id: EntityId,
        next: SyncStatus,
        resolving: bool,
    ) -> Result<()> {
        let current = self
            .get_any(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{}/{id}", E::TABLE)))?;
        current
            .meta()
            .local_sync_status
            .ensure_transition(next, resolving, format!("{}/{id}", E::TABLE))
    }

    /// Store the server's copy of a pending row as `synced`
    pub async fn acknowledge(&self, entity: &E) -> Result<()> {
        let id = entity.meta().require_id()?;
        self.check_transition(id, SyncStatus::Synced, false).await?;
        let mut acknowledged = entity.clone();
        acknowledged.meta_mut().local_sync_status = SyncStatus::Synced;
        acknowledged.meta_mut().sync_error = None;
        self.upsert(&acknowledged).await
    }

    /// Park the record until someone resolves it explicitly
    pub async fn mark_conflict(&self, id: EntityId, reason: &str) -> Result<()> {
        self.check_transition(id, SyncStatus::Conflict, false).await?;
        self.conn
            .execute(
                &format!(
                    "UPDATE {} SET local_sync_status = 'conflict', sync_error = ? WHERE id = ?",
                    Self::table()
                ),
                Params::Positional(vec![
                    Value::Text(reason.to_string()),
                    Value::Text(id.as_str()),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Adopt a server version while a newer local edit is still queued
    pub async fn set_version(&self, id: EntityId, version: i64) -> Result<()> {
        self.conn
            .execute(
                &format!("UPDATE {} SET version = ? WHERE id = ?", Self::table()),
                Params::Positional(vec![Value::Integer(version), Value::Text(id.as_str())]),
            )
            .await?;
        Ok(())
    }

    /// Re-enter the push cycle on top of `version` (conflict resolution)
    pub async fn mark_pending(&self, id: EntityId, version: i64, now: i64) -> Result<()> {
        self.check_transition(id, SyncStatus::Pending, true).await?;
        self.conn
            .execute(
                &format!(
                    "UPDATE {} SET version = ?, local_sync_status = 'pending', sync_error = NULL,
                     updated_at = ? WHERE id = ?",
                    Self::table()
                ),
                Params::Positional(vec![
                    Value::Integer(version),
                    Value::Integer(now),
                    Value::Text(id.as_str()),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Physically remove a row that never existed remotely.
    ///
    /// Only used to revert a rejected create; user deletes are tombstones.
    pub async fn delete_row(&self, id: EntityId) -> Result<()> {
        self.conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?", Self::table()),
                Self::id_param(id),
            )
            .await?;
        Ok(())
    }

    /// Records parked in `conflict`, newest edit first
    pub async fn list_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, version, sync_error, updated_at FROM {}
                     WHERE local_sync_status = 'conflict' ORDER BY updated_at DESC",
                    Self::table()
                ),
                (),
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut reader = RowReader::new(&row);
            conflicts.push(SyncConflict {
                table: E::TABLE,
                entity_id: reader.id()?,
                local_version: reader.int()?,
                reason: reader.opt_text()?,
                updated_at: reader.int()?,
            });
        }
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query::new_entity_id;
    use crate::db::Database;
    use crate::models::{Account, AccountKind, Category, CategoryKind, Table};
    use pretty_assertions::assert_eq;

    fn saved_account(name: &str) -> Account {
        let mut account = Account::new(name, AccountKind::Checking, "USD");
        account.meta.id = Some(new_entity_id());
        account.meta.created_at = 1_000;
        account.meta.updated_at = 1_000;
        account
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_then_get_round_trips_the_row() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LocalRepository::<Account>::new(db.connection());

        let mut account = saved_account("Checking");
        account.balance_cents = -4_200;
        repo.upsert(&account).await.unwrap();

        let loaded = repo.get(account.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(loaded, account);
        assert_eq!(loaded.meta.local_sync_status, SyncStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstones_are_excluded_from_default_queries_only() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LocalRepository::<Account>::new(db.connection());

        let active = saved_account("Active");
        let mut deleted = saved_account("Deleted");
        deleted.meta.deleted_at = Some(2_000);
        repo.upsert(&active).await.unwrap();
        repo.upsert(&deleted).await.unwrap();

        let listed = repo.list(&Query::active()).await.unwrap();
        assert_eq!(listed, vec![active.clone()]);

        let tombstones = repo.list(&Query::tombstones()).await.unwrap();
        assert_eq!(tombstones.len(), 1);
        assert!(tombstones.iter().all(|record| record.meta.deleted_at.is_some()));

        let deleted_id = deleted.id().unwrap();
        assert!(repo.get(deleted_id).await.unwrap().is_none());
        assert!(repo.get_any(deleted_id).await.unwrap().is_some());
        assert_eq!(repo.count(&Query::active()).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_remote_respects_versions_and_local_edits() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LocalRepository::<Category>::new(db.connection());

        let mut remote = Category::new("Food", CategoryKind::Expense);
        remote.meta.id = Some(new_entity_id());
        remote.meta.version = 5;
        let id = remote.id().unwrap();

        assert!(repo.apply_remote(remote.clone()).await.unwrap());
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.meta.local_sync_status, SyncStatus::Synced);

        let mut stale = remote.clone();
        stale.meta.version = 3;
        stale.name = "Stale".into();
        assert!(!repo.apply_remote(stale).await.unwrap());

        // Idempotent re-apply of the same version
        assert!(repo.apply_remote(remote.clone()).await.unwrap());

        let mut edited = remote.clone();
        edited.name = "Dining".into();
        edited.meta.local_sync_status = SyncStatus::Pending;
        repo.upsert(&edited).await.unwrap();

        let mut newer = remote.clone();
        newer.meta.version = 9;
        newer.name = "Groceries".into();
        assert!(!repo.apply_remote(newer.clone()).await.unwrap());
        assert_eq!(repo.get(id).await.unwrap().unwrap().name, "Dining");

        repo.mark_conflict(id, "stale").await.unwrap();
        assert!(!repo.apply_remote(newer.clone()).await.unwrap());

        repo.mark_pending(id, 9, 50).await.unwrap();
        let reopened = repo.get(id).await.unwrap().unwrap();
        assert_eq!(reopened.meta.version, 9);
        assert_eq!(reopened.meta.local_sync_status, SyncStatus::Pending);
        assert_eq!(reopened.meta.sync_error, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_updates_and_conflict_listing() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LocalRepository::<Account>::new(db.connection());

        let first = saved_account("One");
        let second = saved_account("Two");
        repo.upsert(&first).await.unwrap();
        repo.upsert(&second).await.unwrap();

        let mut acknowledged = first.clone();
        acknowledged.meta.version = 11;
        repo.acknowledge(&acknowledged).await.unwrap();
        repo.mark_conflict(second.id().unwrap(), "stale version")
            .await
            .unwrap();

        let synced = repo
            .list(&Query::unfiltered().with(Filter::Status(SyncStatus::Synced)))
            .await
            .unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].meta.version, 11);

        let conflicts = repo.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity_id, second.id().unwrap());
        assert_eq!(conflicts[0].reason.as_deref(), Some("stale version"));
        assert_eq!(conflicts[0].table, Table::Accounts);

        repo.delete_row(first.id().unwrap()).await.unwrap();
        assert!(repo.get_any(first.id().unwrap()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn illegal_status_moves_are_refused() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LocalRepository::<Account>::new(db.connection());

        let synced = saved_account("Synced");
        let parked = saved_account("Parked");
        repo.upsert(&synced).await.unwrap();
        repo.upsert(&parked).await.unwrap();
        repo.acknowledge(&synced).await.unwrap();
        repo.mark_conflict(parked.id().unwrap(), "stale").await.unwrap();

        // Only a version mismatch on a pending push parks a record
        let error = repo.mark_conflict(synced.id().unwrap(), "late").await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));

        // Nothing acknowledges or re-queues a parked record implicitly
        let error = repo.acknowledge(&parked).await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        let error = repo.mark_pending(synced.id().unwrap(), 3, 10).await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));

        let stored = repo.get(parked.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.meta.local_sync_status, SyncStatus::Conflict);

        let missing = repo.mark_conflict(new_entity_id(), "gone").await.unwrap_err();
        assert!(matches!(missing, Error::NotFound(_)));
    }
}

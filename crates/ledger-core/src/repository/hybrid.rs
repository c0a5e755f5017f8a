//! Local-first repository.
//!
//! Reads are served by the local store when it is available. Writes land in
//! the local store and the outbox in one transaction and are pushed to the
//! remote afterwards. Without a local store every call goes straight to the
//! remote authority.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::db::{
    begin, finish, new_entity_id, Filter, LocalHandle, LocalRepository, LocalStore,
    OutboxRepository, Query, SyncMetadataRepository,
};
use crate::error::{Error, Result};
use crate::models::{EntityId, Resolution, SyncConflict, SyncEntity, SyncStatus, Table};
use crate::remote::{decode, RemoteClient, RemoteRepository};
use crate::service::{ConflictObserver, LogObserver};
use crate::sync::{DeltaResponse, PullSummary, PushSummary, TableStatus};
use crate::util::now_millis;

/// When a committed local write is pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushMode {
    /// Spawn a push right after the local commit
    #[default]
    Background,
    /// Leave it queued for the next sweep
    Deferred,
}

/// How a confirmed write enters the status state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteKind {
    /// Ordinary local edit; refused while the record is in `conflict`
    #[default]
    Edit,
    /// Retry of an edit that just came back as a version conflict, on top
    /// of the refreshed server version
    ConflictRetry,
}

/// What happened to one queued push
#[derive(Debug)]
pub enum PushOutcome {
    /// Acknowledged at this server version
    Synced(i64),
    /// Acknowledged, but a newer local edit is already queued behind it
    Superseded(i64),
    /// Version mismatch; the record is parked in `conflict`
    Conflict(Error),
    /// Refused for good; the local edit was reverted
    Rejected(Error),
    /// Transient failure; the entry stays queued
    Failed(Error),
    /// Nothing to push, or earlier entries have to land first
    Skipped,
}

type Retry = Box<dyn Fn() + Send + Sync>;

/// Serializes pushes across every repository sharing it.
///
/// The lock is fair, so pushes reach the remote in the order they were
/// requested and a parent queued before its child lands first. Background
/// sweeps that found a parent table still queued park here and are started
/// again once some sweep lands an entry.
#[derive(Default)]
pub struct PushGate {
    lock: Mutex<()>,
    in_flight: Arc<InFlight>,
    parked: StdMutex<HashMap<Table, Retry>>,
}

impl PushGate {
    pub fn new() -> Self {
        Self::default()
    }

    async fn enter(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    fn parked(&self) -> StdMutexGuard<'_, HashMap<Table, Retry>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One retry per table; a later park replaces the earlier one
    fn park(&self, table: Table, retry: Retry) {
        self.parked().insert(table, retry);
    }

    fn wake_parked(&self) {
        let retries: Vec<Retry> = self.parked().drain().map(|(_, retry)| retry).collect();
        for retry in retries {
            retry();
        }
    }

    /// Wait until every spawned background push has finished
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await;
    }
}

/// Background pushes that have not finished yet
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Local store plus remote authority for one entity type
pub struct HybridRepository<E> {
    store: Arc<LocalStore>,
    remote: RemoteRepository<E>,
    gate: Arc<PushGate>,
    observer: Arc<dyn ConflictObserver>,
    mode: PushMode,
}

impl<E> Clone for HybridRepository<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            remote: self.remote.clone(),
            gate: Arc::clone(&self.gate),
            observer: Arc::clone(&self.observer),
            mode: self.mode,
        }
    }
}

impl<E: SyncEntity> HybridRepository<E> {
    pub fn new(store: Arc<LocalStore>, client: Arc<dyn RemoteClient>) -> Self {
        Self {
            store,
            remote: RemoteRepository::new(client),
            gate: Arc::new(PushGate::new()),
            observer: Arc::new(LogObserver),
            mode: PushMode::default(),
        }
    }

    /// Share one push order with the other repositories of a ledger
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<PushGate>) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ConflictObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub const fn with_push_mode(mut self, mode: PushMode) -> Self {
        self.mode = mode;
        self
    }

    pub const fn remote(&self) -> &RemoteRepository<E> {
        &self.remote
    }

    pub const fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    fn not_found(id: EntityId) -> Error {
        Error::NotFound(format!("{}/{id}", E::TABLE))
    }

    /// Active record by id
    pub async fn get(&self, id: EntityId) -> Result<Option<E>> {
        match self.store.ready().await {
            Some(handle) => {
                let db = handle.lock().await;
                LocalRepository::<E>::new(db.connection()).get(id).await
            }
            None => self.remote.get(id).await,
        }
    }

    async fn get_any(&self, id: EntityId) -> Result<Option<E>> {
        match self.store.ready().await {
            Some(handle) => {
                let db = handle.lock().await;
                LocalRepository::<E>::new(db.connection()).get_any(id).await
            }
            None => self.remote.get_any(id).await,
        }
    }

    pub async fn list(&self, query: &Query) -> Result<Vec<E>> {
        match self.store.ready().await {
            Some(handle) => {
                let db = handle.lock().await;
                LocalRepository::<E>::new(db.connection()).list(query).await
            }
            None => self.remote.list(query).await,
        }
    }

    /// All active records, most recently edited first
    pub async fn list_active(&self) -> Result<Vec<E>> {
        self.list(&Query::active()).await
    }

    pub async fn count(&self, query: &Query) -> Result<i64> {
        match self.store.ready().await {
            Some(handle) => {
                let db = handle.lock().await;
                LocalRepository::<E>::new(db.connection()).count(query).await
            }
            None => {
                let records = self.remote.list(query).await?;
                Ok(i64::try_from(records.len()).unwrap_or(i64::MAX))
            }
        }
    }

    /// Authoritative version, used to retry after a conflict
    pub async fn remote_version(&self, id: EntityId) -> Result<i64> {
        self.remote.current_version(id).await
    }

    /// Records parked in `conflict`; empty without a local store
    pub async fn list_conflicts(&self) -> Result<Vec<SyncConflict>> {
        match self.store.ready().await {
            Some(handle) => {
                let db = handle.lock().await;
                LocalRepository::<E>::new(db.connection())
                    .list_conflicts()
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn sync_status(&self) -> Result<TableStatus> {
        let mut status = TableStatus {
            table: E::TABLE,
            pending: 0,
            conflicts: 0,
            watermark: crate::models::SyncWatermark::initial(E::TABLE),
        };
        if let Some(handle) = self.store.ready().await {
            let db = handle.lock().await;
            let conn = db.connection();
            status.pending = OutboxRepository::new(conn).count(Some(E::TABLE)).await?;
            status.conflicts = LocalRepository::<E>::new(conn)
                .count(&Query::unfiltered().with(Filter::conflict()))
                .await?;
            status.watermark = SyncMetadataRepository::new(conn).get(E::TABLE).await?;
        }
        Ok(status)
    }

    /// Persist a local edit and queue it for push.
    ///
    /// New records get their id here. The returned record is `pending`; in
    /// background mode a push is already on its way. Without a local store
    /// this is a synchronous remote write.
    pub async fn save(&self, entity: E) -> Result<E> {
        let (saved, queued) = self.write(entity, WriteKind::Edit).await?;
        if queued && self.mode == PushMode::Background {
            self.spawn_push();
        }
        Ok(saved)
    }

    /// Persist a local edit and push it before returning.
    ///
    /// Conflicts and rejections come back as errors. A transient failure
    /// leaves the record queued and returns it as `pending`.
    pub async fn save_confirmed(&self, entity: E) -> Result<E> {
        self.write_confirmed(entity, WriteKind::Edit).await
    }

    /// [`Self::save_confirmed`] with an explicit write kind; the retry
    /// policy uses [`WriteKind::ConflictRetry`] for its second attempt
    pub async fn write_confirmed(&self, entity: E, kind: WriteKind) -> Result<E> {
        let (saved, queued) = self.write(entity, kind).await?;
        if !queued {
            return Ok(saved);
        }
        let id = saved.meta().require_id()?;
        self.confirm(id, saved).await
    }

    /// Tombstone a record; it stays queryable only through sync paths
    pub async fn delete(&self, id: EntityId) -> Result<E> {
        let entity = self.tombstone(id).await?;
        self.save(entity).await
    }

    pub async fn delete_confirmed(&self, id: EntityId) -> Result<E> {
        let entity = self.tombstone(id).await?;
        self.save_confirmed(entity).await
    }

    async fn tombstone(&self, id: EntityId) -> Result<E> {
        let mut entity = self.get(id).await?.ok_or_else(|| Self::not_found(id))?;
        entity.meta_mut().deleted_at = Some(now_millis());
        Ok(entity)
    }

    /// Stamp and store the edit; the flag tells whether it was queued locally
    async fn write(&self, mut entity: E, kind: WriteKind) -> Result<(E, bool)> {
        let now = now_millis();
        let meta = entity.meta_mut();
        if meta.id.is_none() {
            meta.id = Some(new_entity_id());
            meta.created_at = now;
        }
        meta.updated_at = now;
        meta.local_sync_status = SyncStatus::Pending;
        meta.sync_error = None;

        match self.store.ready().await {
            Some(handle) => Ok((self.write_local(&handle, entity, kind, now).await?, true)),
            None => {
                let expected = entity.meta().version;
                Ok((self.remote.write(&entity, expected).await?, false))
            }
        }
    }

    async fn write_local(
        &self,
        handle: &LocalHandle,
        mut entity: E,
        kind: WriteKind,
        now: i64,
    ) -> Result<E> {
        let id = entity.meta().require_id()?;
        let db = handle.lock().await;
        let conn = db.connection();
        let local = LocalRepository::<E>::new(conn);
        let outbox = OutboxRepository::new(conn);

        begin(conn).await?;
        let written = async {
            let existing = local.get_any(id).await?;
            let queued = outbox.get(E::TABLE, id).await?.is_some();
            let mut base_snapshot = None;
            if let Some(row) = &existing {
                let status = row.meta().local_sync_status;
                let resolving =
                    kind == WriteKind::ConflictRetry && status == SyncStatus::Conflict;
                status.ensure_transition(
                    SyncStatus::Pending,
                    resolving,
                    format!("{}/{id}", E::TABLE),
                )?;
                if !queued && row.meta().local_sync_status == SyncStatus::Synced {
                    base_snapshot = Some(serde_json::to_string(row)?);
                }
                let meta = entity.meta_mut();
                meta.version = meta.version.max(row.meta().version);
                meta.created_at = row.meta().created_at;
            }
            local.upsert(&entity).await?;
            outbox.enqueue(E::TABLE, id, base_snapshot, now).await?;
            Ok::<_, Error>(entity)
        }
        .await;
        finish(conn, written).await
    }

    fn spawn_push(&self) {
        let repository = self.clone();
        let guard = self.gate.in_flight.enter();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = repository.sweep(true).await {
                tracing::warn!("Background push for {} failed: {error}", E::TABLE);
            }
        });
    }

    /// Wait until every background push sharing this gate has finished
    pub async fn wait_idle(&self) {
        self.gate.wait_idle().await;
    }

    async fn confirm(&self, id: EntityId, saved: E) -> Result<E> {
        match self.push_record(id).await? {
            PushOutcome::Synced(_) | PushOutcome::Superseded(_) => {
                Ok(self.get_any(id).await?.unwrap_or(saved))
            }
            PushOutcome::Conflict(error) => Err(error),
            PushOutcome::Rejected(error) => {
                self.observer.on_rejected(E::TABLE, id, &error);
                Err(error)
            }
            PushOutcome::Failed(error) => {
                tracing::debug!("{}/{id} stays queued: {error}", E::TABLE);
                Ok(saved)
            }
            PushOutcome::Skipped => Ok(saved),
        }
    }

    fn report(&self, id: EntityId, outcome: &PushOutcome) {
        match outcome {
            PushOutcome::Conflict(error) => self.observer.on_conflict(E::TABLE, id, error),
            PushOutcome::Rejected(error) => self.observer.on_rejected(E::TABLE, id, error),
            _ => {}
        }
    }

    /// Push one record, unless something queued ahead of it must land first
    pub async fn push_record(&self, id: EntityId) -> Result<PushOutcome> {
        let Some(handle) = self.store.ready().await else {
            return Ok(PushOutcome::Skipped);
        };
        let _gate = self.gate.enter().await;

        {
            let db = handle.lock().await;
            let outbox = OutboxRepository::new(db.connection());
            let Some(entry) = outbox.get(E::TABLE, id).await? else {
                return Ok(PushOutcome::Skipped);
            };
            let ahead = outbox
                .count_ahead_of(&entry, &E::TABLE.push_dependencies())
                .await?;
            if ahead > 0 {
                tracing::debug!("{}/{id} waits behind {ahead} queued pushes", E::TABLE);
                return Ok(PushOutcome::Skipped);
            }
        }

        let outcome = self.push_entry(&handle, id).await?;
        if !matches!(outcome, PushOutcome::Failed(_) | PushOutcome::Skipped) {
            self.gate.wake_parked();
        }
        Ok(outcome)
    }

    /// Sweep this table's outbox in order.
    ///
    /// Nothing is pushed while a parent table still has queued entries, and
    /// the sweep stops at the first transient failure so later entries never
    /// overtake it.
    pub async fn push_pending(&self) -> Result<PushSummary> {
        self.sweep(false).await
    }

    /// A background sweep blocked by a queued parent parks itself on the
    /// gate and runs again once a parent entry lands
    async fn sweep(&self, background: bool) -> Result<PushSummary> {
        let mut summary = PushSummary::default();
        let Some(handle) = self.store.ready().await else {
            return Ok(summary);
        };
        let _gate = self.gate.enter().await;

        let entries = {
            let db = handle.lock().await;
            let outbox = OutboxRepository::new(db.connection());
            for parent in E::TABLE.push_dependencies() {
                if outbox.count(Some(parent)).await? > 0 {
                    tracing::debug!("{} push waits for queued {parent}", E::TABLE);
                    if background {
                        let retry = self.clone();
                        self.gate.park(E::TABLE, Box::new(move || retry.spawn_push()));
                    }
                    return Ok(summary);
                }
            }
            outbox.list(E::TABLE).await?
        };

        for entry in entries {
            let id = entry.entity_id;
            let outcome = self.push_entry(&handle, id).await?;
            self.report(id, &outcome);
            match outcome {
                PushOutcome::Synced(_) | PushOutcome::Superseded(_) => summary.synced += 1,
                PushOutcome::Conflict(_) => summary.conflicts += 1,
                PushOutcome::Rejected(_) => summary.rejected += 1,
                PushOutcome::Failed(_) => {
                    summary.failed += 1;
                    break;
                }
                PushOutcome::Skipped => {}
            }
        }

        if summary.attempted() > 0 {
            tracing::debug!("Pushed {}: {summary:?}", E::TABLE);
        }
        if summary.attempted() > summary.failed {
            self.gate.wake_parked();
        }
        Ok(summary)
    }

    /// The push itself; the caller holds the gate
    async fn push_entry(&self, handle: &LocalHandle, id: EntityId) -> Result<PushOutcome> {
        let (entity, entry) = {
            let db = handle.lock().await;
            let conn = db.connection();
            let outbox = OutboxRepository::new(conn);
            let Some(entry) = outbox.get(E::TABLE, id).await? else {
                return Ok(PushOutcome::Skipped);
            };
            match LocalRepository::<E>::new(conn).get_any(id).await? {
                Some(entity) if entity.meta().local_sync_status != SyncStatus::Conflict => {
                    (entity, entry)
                }
                _ => {
                    outbox.remove(E::TABLE, id).await?;
                    return Ok(PushOutcome::Skipped);
                }
            }
        };

        let sent_version = entity.meta().version;
        let result = self.remote.write(&entity, sent_version).await;

        let db = handle.lock().await;
        let conn = db.connection();
        let local = LocalRepository::<E>::new(conn);
        let outbox = OutboxRepository::new(conn);

        match result {
            Ok(stored) => {
                let version = stored.meta().version;
                begin(conn).await?;
                let acknowledged = async {
                    if outbox.complete(E::TABLE, id, entry.revision).await? {
                        local.acknowledge(&stored).await?;
                        Ok::<_, Error>(PushOutcome::Synced(version))
                    } else {
                        // The queued edit now builds on what the remote holds
                        local.set_version(id, version).await?;
                        outbox
                            .set_snapshot(E::TABLE, id, &serde_json::to_string(&stored)?)
                            .await?;
                        Ok(PushOutcome::Superseded(version))
                    }
                }
                .await;
                finish(conn, acknowledged).await
            }
            Err(error) if error.is_conflict() => {
                begin(conn).await?;
                let parked = async {
                    local.mark_conflict(id, &error.to_string()).await?;
                    outbox.remove(E::TABLE, id).await
                }
                .await;
                finish(conn, parked).await?;
                tracing::warn!("Push of {}/{id} at version {sent_version} conflicted", E::TABLE);
                Ok(PushOutcome::Conflict(error))
            }
            Err(error) if error.is_rejection() => {
                begin(conn).await?;
                let reverted = async {
                    match &entry.base_snapshot {
                        Some(snapshot) => {
                            let base: E = serde_json::from_str(snapshot)?;
                            local.acknowledge(&base).await?;
                        }
                        None if sent_version == 0 => local.delete_row(id).await?,
                        None => local.mark_conflict(id, &error.to_string()).await?,
                    }
                    outbox.remove(E::TABLE, id).await
                }
                .await;
                finish(conn, reverted).await?;
                tracing::warn!("Push of {}/{id} rejected: {error}", E::TABLE);
                Ok(PushOutcome::Rejected(error))
            }
            Err(error) => {
                outbox
                    .record_failure(E::TABLE, id, &error.to_string(), now_millis())
                    .await?;
                tracing::debug!("Push of {}/{id} failed, kept queued: {error}", E::TABLE);
                Ok(PushOutcome::Failed(error))
            }
        }
    }

    async fn require_conflict(local: &LocalRepository<'_, E>, id: EntityId) -> Result<()> {
        let row = local.get_any(id).await?.ok_or_else(|| Self::not_found(id))?;
        if row.meta().local_sync_status == SyncStatus::Conflict {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "{}/{id} is not in conflict",
                E::TABLE
            )))
        }
    }

    /// Leave `conflict` by adopting one side.
    ///
    /// Returns the record as it stands afterwards; `None` when the remote no
    /// longer has it and the remote side was kept.
    pub async fn resolve_conflict(&self, id: EntityId, resolution: Resolution) -> Result<Option<E>> {
        let handle = self.store.ready().await.ok_or_else(|| {
            Error::StorageUnavailable("conflicts are only tracked locally".to_string())
        })?;
        {
            let db = handle.lock().await;
            Self::require_conflict(&LocalRepository::<E>::new(db.connection()), id).await?;
        }
        let server = self.remote.get_any(id).await?;

        {
            let _gate = self.gate.enter().await;
            let db = handle.lock().await;
            let conn = db.connection();
            let local = LocalRepository::<E>::new(conn);
            let outbox = OutboxRepository::new(conn);

            // Re-checked under the gate; a push may have raced the fetch
            Self::require_conflict(&local, id).await?;

            let now = now_millis();
            begin(conn).await?;
            let resolved = async {
                match resolution {
                    Resolution::KeepRemote => {
                        match &server {
                            Some(record) => local.upsert(record).await?,
                            None => local.delete_row(id).await?,
                        }
                        outbox.remove(E::TABLE, id).await
                    }
                    Resolution::KeepLocal => {
                        let version = server.as_ref().map_or(0, |record| record.meta().version);
                        let base_snapshot =
                            server.as_ref().map(serde_json::to_string).transpose()?;
                        local.mark_pending(id, version, now).await?;
                        outbox.enqueue(E::TABLE, id, base_snapshot, now).await?;
                        Ok(())
                    }
                }
            }
            .await;
            finish(conn, resolved).await?;
        }

        tracing::info!("Resolved {}/{id} with {resolution:?}", E::TABLE);
        match resolution {
            Resolution::KeepRemote => Ok(server),
            Resolution::KeepLocal => {
                let pending = self.get_any(id).await?.ok_or_else(|| Self::not_found(id))?;
                self.confirm(id, pending).await.map(Some)
            }
        }
    }

    /// Pull remote changes above the watermark in batches.
    ///
    /// Each batch is applied and the watermark advanced in one transaction,
    /// so an interrupted apply leaves the watermark where it was. When
    /// `is_current` turns false while a batch is in flight, the batch is
    /// discarded. A batch that lost the race against another pull is
    /// fetched again from the new watermark.
    pub async fn pull_changes(
        &self,
        batch_size: u32,
        is_current: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<PullSummary> {
        let mut summary = PullSummary::default();
        let Some(handle) = self.store.ready().await else {
            return Ok(summary);
        };

        loop {
            let since = {
                let db = handle.lock().await;
                SyncMetadataRepository::new(db.connection())
                    .get(E::TABLE)
                    .await?
                    .last_synced_version
            };
            summary.watermark = since;

            let delta = self.remote.changes_since(since, batch_size).await?;
            if !is_current() {
                tracing::debug!("Discarding stale {} batch above {since}", E::TABLE);
                summary.superseded = true;
                return Ok(summary);
            }
            let has_more = delta.has_more;
            let target = delta.current_server_version;

            let db = handle.lock().await;
            let conn = db.connection();
            begin(conn).await?;
            let applied = Self::apply_batch(conn, since, delta).await;
            let Some((applied, skipped)) = finish(conn, applied).await? else {
                drop(db);
                if is_current() {
                    tracing::debug!(
                        "{} watermark moved past {since} during the pull, fetching again",
                        E::TABLE
                    );
                    continue;
                }
                summary.superseded = true;
                return Ok(summary);
            };
            drop(db);

            summary.applied += applied;
            summary.skipped += skipped;
            summary.batches += 1;
            summary.watermark = target.max(since);

            if !has_more || target <= since {
                break;
            }
        }

        if summary.applied > 0 {
            tracing::debug!(
                "Pulled {} {} records up to version {}",
                summary.applied,
                E::TABLE,
                summary.watermark
            );
        }
        Ok(summary)
    }

    /// `None` when another pull moved the watermark first
    async fn apply_batch(
        conn: &libsql::Connection,
        since: i64,
        delta: DeltaResponse<JsonValue>,
    ) -> Result<Option<(usize, usize)>> {
        let watermarks = SyncMetadataRepository::new(conn);
        if watermarks.get(E::TABLE).await?.last_synced_version != since {
            return Ok(None);
        }

        let target = delta.current_server_version;
        let local = LocalRepository::<E>::new(conn);
        let (mut applied, mut skipped) = (0, 0);
        for record in delta.into_records() {
            let entity: E = decode(record)?;
            if local.apply_remote(entity).await? {
                applied += 1;
            } else {
                skipped += 1;
            }
        }

        watermarks.advance(E::TABLE, target, now_millis()).await?;
        Ok(Some((applied, skipped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, AccountKind, Category, CategoryKind, Currency, Transaction};
    use crate::remote::{MemoryRemote, RemoteError, RemoteResult};
    use crate::sync::DeltaRequest;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    fn always() -> impl Fn() -> bool + Send + Sync {
        || true
    }

    fn setup<E: SyncEntity>(mode: PushMode) -> (HybridRepository<E>, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::new());
        let repo = HybridRepository::new(Arc::new(LocalStore::in_memory()), remote.clone())
            .with_push_mode(mode);
        (repo, remote)
    }

    #[derive(Default)]
    struct Recorder {
        conflicts: StdMutex<Vec<EntityId>>,
        rejected: StdMutex<Vec<EntityId>>,
    }

    impl ConflictObserver for Recorder {
        fn on_conflict(&self, _table: Table, id: EntityId, _error: &Error) {
            self.conflicts.lock().unwrap().push(id);
        }

        fn on_rejected(&self, _table: Table, id: EntityId, _error: &Error) {
            self.rejected.lock().unwrap().push(id);
        }
    }

    /// Memory remote that can hold one write in flight, or let another pull
    /// of the same store land right before the first delta is returned
    struct Interposed {
        inner: Arc<MemoryRemote>,
        hold_next_write: AtomicBool,
        write_started: Notify,
        release_write: Notify,
        race_pull_into: StdMutex<Option<Arc<LocalStore>>>,
    }

    impl Interposed {
        fn new(inner: Arc<MemoryRemote>) -> Self {
            Self {
                inner,
                hold_next_write: AtomicBool::new(false),
                write_started: Notify::new(),
                release_write: Notify::new(),
                race_pull_into: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl RemoteClient for Interposed {
        async fn fetch(&self, table: Table, id: EntityId) -> RemoteResult<Option<JsonValue>> {
            self.inner.fetch(table, id).await
        }

        async fn select(&self, table: Table, query: &Query) -> RemoteResult<Vec<JsonValue>> {
            self.inner.select(table, query).await
        }

        async fn write(
            &self,
            table: Table,
            record: JsonValue,
            expected_version: i64,
        ) -> RemoteResult<JsonValue> {
            if self.hold_next_write.swap(false, Ordering::SeqCst) {
                self.write_started.notify_one();
                self.release_write.notified().await;
            }
            self.inner.write(table, record, expected_version).await
        }

        async fn changes_since(
            &self,
            request: &DeltaRequest,
        ) -> RemoteResult<DeltaResponse<JsonValue>> {
            let delta = self.inner.changes_since(request).await?;
            let racing = self.race_pull_into.lock().unwrap().take();
            if let Some(store) = racing {
                let other = HybridRepository::<Category>::new(store, self.inner.clone());
                other
                    .pull_changes(100, &|| true)
                    .await
                    .map_err(|error| RemoteError::unreachable(error.to_string()))?;
            }
            Ok(delta)
        }

        async fn rpc(&self, name: &str, args: JsonValue) -> RemoteResult<JsonValue> {
            self.inner.rpc(name, args).await
        }

        async fn list_currencies(&self) -> RemoteResult<Vec<Currency>> {
            self.inner.list_currencies().await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_assigns_id_and_background_push_syncs() {
        let (repo, remote) = setup::<Account>(PushMode::Background);

        let saved = repo
            .save(Account::new("Checking", AccountKind::Checking, "USD"))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();
        assert_eq!(saved.meta.local_sync_status, SyncStatus::Pending);
        assert!(saved.meta.created_at > 0);

        repo.wait_idle().await;
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(stored.meta.version, remote.current_version());
        assert!(remote.record(Table::Accounts, id).is_some());
        assert_eq!(repo.sync_status().await.unwrap().pending, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_writes_stay_queued_until_the_sweep() {
        let (repo, remote) = setup::<Account>(PushMode::Deferred);
        remote.set_offline(true);

        let saved = repo
            .save_confirmed(Account::new("Cash", AccountKind::Cash, "EUR"))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();
        assert_eq!(saved.meta.local_sync_status, SyncStatus::Pending);
        assert_eq!(repo.get(id).await.unwrap().unwrap().name, "Cash");

        let summary = repo.push_pending().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(repo.sync_status().await.unwrap().pending, 1);

        remote.set_offline(false);
        let summary = repo.push_pending().await.unwrap();
        assert_eq!(summary.synced, 1);
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(remote.record_count(Table::Accounts), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn children_wait_for_queued_parents() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(LocalStore::in_memory());
        let gate = Arc::new(PushGate::new());
        let accounts = HybridRepository::<Account>::new(store.clone(), remote.clone())
            .with_gate(gate.clone())
            .with_push_mode(PushMode::Deferred);
        let transactions = HybridRepository::<Transaction>::new(store, remote.clone())
            .with_gate(gate)
            .with_push_mode(PushMode::Deferred);

        remote.set_offline(true);
        let account = accounts
            .save(Account::new("Checking", AccountKind::Checking, "USD"))
            .await
            .unwrap();
        remote.set_offline(false);

        let tx = transactions
            .save_confirmed(Transaction::new(account.meta.id.unwrap(), -500, "USD", "Coffee"))
            .await
            .unwrap();
        assert_eq!(tx.meta.local_sync_status, SyncStatus::Pending);
        assert_eq!(transactions.push_pending().await.unwrap().attempted(), 0);

        assert_eq!(accounts.push_pending().await.unwrap().synced, 1);
        assert_eq!(transactions.push_pending().await.unwrap().synced, 1);
        assert_eq!(remote.record_count(Table::Transactions), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_version_parks_the_record_in_conflict() {
        let (repo, remote) = setup::<Category>(PushMode::Deferred);
        let observer = Arc::new(Recorder::default());
        let repo = repo.with_observer(observer.clone());

        let saved = repo
            .save_confirmed(Category::new("Food", CategoryKind::Expense))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();

        // Another device renames it first
        let mut other = saved.clone();
        other.name = "Groceries".into();
        repo.remote().write(&other, saved.meta.version).await.unwrap();

        let mut mine = saved.clone();
        mine.name = "Dining".into();
        let error = repo.save_confirmed(mine).await.unwrap_err();
        assert!(error.is_conflict());

        let parked = repo.get(id).await.unwrap().unwrap();
        assert_eq!(parked.name, "Dining");
        assert_eq!(parked.meta.local_sync_status, SyncStatus::Conflict);
        assert_eq!(repo.list_conflicts().await.unwrap().len(), 1);
        assert_eq!(repo.sync_status().await.unwrap().pending, 0);
        assert_eq!(
            remote.record(Table::Categories, id).unwrap()["name"],
            "Groceries"
        );

        // Pulls never overwrite the parked edit
        repo.pull_changes(100, &always()).await.unwrap();
        assert_eq!(repo.get(id).await.unwrap().unwrap().name, "Dining");

        // Plain edits do not leave `conflict` either
        let mut again = parked.clone();
        again.name = "Eating out".into();
        let error = repo.save(again).await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        let still = repo.get(id).await.unwrap().unwrap();
        assert_eq!(still.name, "Dining");
        assert_eq!(still.meta.local_sync_status, SyncStatus::Conflict);
        assert_eq!(repo.sync_status().await.unwrap().pending, 0);

        let resolved = repo
            .resolve_conflict(id, Resolution::KeepLocal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(remote.record(Table::Categories, id).unwrap()["name"], "Dining");
        assert!(observer.conflicts.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_remote_adopts_the_server_copy() {
        let (repo, _remote) = setup::<Category>(PushMode::Deferred);
        let saved = repo
            .save_confirmed(Category::new("Food", CategoryKind::Expense))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();

        let mut other = saved.clone();
        other.name = "Groceries".into();
        repo.remote().write(&other, saved.meta.version).await.unwrap();

        let mut mine = saved;
        mine.name = "Dining".into();
        repo.save(mine).await.unwrap();
        let summary = repo.push_pending().await.unwrap();
        assert_eq!(summary.conflicts, 1);

        let resolved = repo
            .resolve_conflict(id, Resolution::KeepRemote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.name, "Groceries");
        let local = repo.get(id).await.unwrap().unwrap();
        assert_eq!(local.name, "Groceries");
        assert_eq!(local.meta.local_sync_status, SyncStatus::Synced);

        let error = repo
            .resolve_conflict(id, Resolution::KeepRemote)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_edit_reverts_to_the_acknowledged_row() {
        let (repo, _remote) = setup::<Account>(PushMode::Deferred);
        let observer = Arc::new(Recorder::default());
        let repo = repo.with_observer(observer.clone());

        let saved = repo
            .save_confirmed(Account::new("Checking", AccountKind::Checking, "USD"))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();

        let mut invalid = saved.clone();
        invalid.currency_code = "dollars".into();
        let error = repo.save_confirmed(invalid).await.unwrap_err();
        assert!(matches!(error, Error::Validation(_)));

        let reverted = repo.get(id).await.unwrap().unwrap();
        assert_eq!(reverted.currency_code, "USD");
        assert_eq!(reverted.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(observer.rejected.lock().unwrap().as_slice(), &[id]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_create_is_removed_locally() {
        let (repo, remote) = setup::<Account>(PushMode::Deferred);
        let saved = repo
            .save(Account::new("Broken", AccountKind::Cash, "XXX"))
            .await
            .unwrap();

        let summary = repo.push_pending().await.unwrap();
        assert_eq!(summary.rejected, 1);
        assert!(repo.get(saved.meta.id.unwrap()).await.unwrap().is_none());
        assert_eq!(remote.record_count(Table::Accounts), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_writes_a_tombstone() {
        let (repo, remote) = setup::<Account>(PushMode::Deferred);
        let saved = repo
            .save_confirmed(Account::new("Old", AccountKind::Savings, "USD"))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();

        let deleted = repo.delete_confirmed(id).await.unwrap();
        assert!(deleted.meta.deleted_at.is_some());
        assert!(repo.get(id).await.unwrap().is_none());
        assert!(repo.list_active().await.unwrap().is_empty());
        assert!(!remote.record(Table::Accounts, id).unwrap()["deleted_at"].is_null());

        let error = repo.delete(id).await.unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_applies_remote_changes_and_is_idempotent() {
        let (writer, remote) = setup::<Category>(PushMode::Deferred);
        let reader = HybridRepository::<Category>::new(
            Arc::new(LocalStore::in_memory()),
            remote.clone(),
        );

        for name in ["Food", "Rent", "Travel"] {
            writer
                .save_confirmed(Category::new(name, CategoryKind::Expense))
                .await
                .unwrap();
        }

        let first = reader.pull_changes(2, &always()).await.unwrap();
        assert_eq!(first.applied, 3);
        assert_eq!(first.batches, 2);
        assert_eq!(first.watermark, remote.current_version());

        let second = reader.pull_changes(2, &always()).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(reader.list_active().await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn superseded_pull_is_discarded() {
        let (writer, remote) = setup::<Category>(PushMode::Deferred);
        writer
            .save_confirmed(Category::new("Food", CategoryKind::Expense))
            .await
            .unwrap();

        let reader =
            HybridRepository::<Category>::new(Arc::new(LocalStore::in_memory()), remote);
        let summary = reader.pull_changes(10, &|| false).await.unwrap();
        assert!(summary.superseded);
        assert_eq!(summary.applied, 0);
        assert_eq!(reader.sync_status().await.unwrap().watermark.last_synced_version, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_store_routes_through_the_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let repo = HybridRepository::<Account>::new(Arc::new(LocalStore::disabled()), remote.clone());

        let saved = repo
            .save(Account::new("Remote only", AccountKind::Checking, "USD"))
            .await
            .unwrap();
        assert_eq!(saved.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(saved.meta.version, remote.current_version());

        let id = saved.meta.id.unwrap();
        assert_eq!(repo.get(id).await.unwrap().unwrap().name, "Remote only");
        assert_eq!(repo.count(&Query::active()).await.unwrap(), 1);
        assert!(repo.list_conflicts().await.unwrap().is_empty());
        assert_eq!(repo.pull_changes(10, &always()).await.unwrap(), PullSummary::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_retry_rewrites_the_parked_record() {
        let (repo, remote) = setup::<Category>(PushMode::Deferred);
        let saved = repo
            .save_confirmed(Category::new("Food", CategoryKind::Expense))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();

        let mut other = saved.clone();
        other.name = "Groceries".into();
        repo.remote().write(&other, saved.meta.version).await.unwrap();

        let mut mine = saved.clone();
        mine.name = "Dining".into();
        assert!(repo.save_confirmed(mine.clone()).await.unwrap_err().is_conflict());

        mine.meta.version = repo.remote_version(id).await.unwrap();
        let retried = repo
            .write_confirmed(mine, WriteKind::ConflictRetry)
            .await
            .unwrap();
        assert_eq!(retried.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(retried.meta.version, remote.current_version());
        assert_eq!(remote.record(Table::Categories, id).unwrap()["name"], "Dining");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn superseded_push_moves_the_revert_target() {
        let remote = Arc::new(MemoryRemote::new());
        let client = Arc::new(Interposed::new(remote.clone()));
        let repo = HybridRepository::<Account>::new(Arc::new(LocalStore::in_memory()), client.clone())
            .with_push_mode(PushMode::Deferred);

        let saved = repo
            .save_confirmed(Account::new("A", AccountKind::Checking, "USD"))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();

        let mut renamed = saved.clone();
        renamed.name = "B".into();
        repo.save(renamed).await.unwrap();

        client.hold_next_write.store(true, Ordering::SeqCst);
        let sweeping = tokio::spawn({
            let repo = repo.clone();
            async move { repo.push_pending().await }
        });
        client.write_started.notified().await;

        // Queued behind the rename while it is on the wire
        let mut invalid = repo.get(id).await.unwrap().unwrap();
        invalid.currency_code = "dollars".into();
        repo.save(invalid).await.unwrap();

        client.release_write.notify_one();
        assert_eq!(sweeping.await.unwrap().unwrap().synced, 1);

        let pulled = repo.pull_changes(100, &always()).await.unwrap();
        assert_eq!(pulled.skipped, 1);
        assert_eq!(pulled.watermark, remote.current_version());

        assert_eq!(repo.push_pending().await.unwrap().rejected, 1);
        assert_eq!(repo.pull_changes(100, &always()).await.unwrap().applied, 0);

        let local = repo.get(id).await.unwrap().unwrap();
        assert_eq!(local.name, "B");
        assert_eq!(local.currency_code, "USD");
        assert_eq!(local.meta.version, remote.current_version());
        assert_eq!(local.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(remote.record(Table::Accounts, id).unwrap()["name"], "B");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parked_child_sweep_runs_once_the_parent_lands() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(LocalStore::in_memory());
        let gate = Arc::new(PushGate::new());
        let accounts = HybridRepository::<Account>::new(store.clone(), remote.clone())
            .with_gate(gate.clone())
            .with_push_mode(PushMode::Deferred);
        let transactions = HybridRepository::<Transaction>::new(store, remote.clone())
            .with_gate(gate)
            .with_push_mode(PushMode::Background);

        let account = accounts
            .save(Account::new("Checking", AccountKind::Checking, "USD"))
            .await
            .unwrap();
        transactions
            .save(Transaction::new(account.meta.id.unwrap(), -500, "USD", "Coffee"))
            .await
            .unwrap();
        transactions.wait_idle().await;
        assert_eq!(remote.record_count(Table::Transactions), 0);

        assert_eq!(accounts.push_pending().await.unwrap().synced, 1);
        transactions.wait_idle().await;
        assert_eq!(remote.record_count(Table::Transactions), 1);
        assert_eq!(transactions.sync_status().await.unwrap().pending, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_that_lost_the_race_fetches_again() {
        let (writer, remote) = setup::<Category>(PushMode::Deferred);
        for name in ["Food", "Rent"] {
            writer
                .save_confirmed(Category::new(name, CategoryKind::Expense))
                .await
                .unwrap();
        }

        let store = Arc::new(LocalStore::in_memory());
        let client = Interposed::new(remote.clone());
        *client.race_pull_into.lock().unwrap() = Some(store.clone());
        let reader = HybridRepository::<Category>::new(store, Arc::new(client));

        let summary = reader.pull_changes(100, &always()).await.unwrap();
        assert!(!summary.superseded);
        assert_eq!(summary.watermark, remote.current_version());
        assert_eq!(reader.list_active().await.unwrap().len(), 2);
    }
}

//! Sync orchestration across tables.
//!
//! Pushes run in dependency order, then every table is pulled. A failure in
//! one table is recorded in the report and the run moves on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::db::{begin, finish, CurrencyRepository, LocalStore};
use crate::error::{Error, Result};
use crate::models::{SyncEntity, Table};
use crate::remote::RemoteClient;
use crate::repository::HybridRepository;

use super::{PullSummary, PushSummary, SyncReport, TableReport};

/// One table as seen by the engine
#[async_trait]
pub trait TableSync: Send + Sync {
    fn table(&self) -> Table;

    /// Pull remote changes; `is_current` turns false once a newer pull for
    /// the same table has started
    async fn pull(
        &self,
        batch_size: u32,
        is_current: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<PullSummary>;

    /// Sweep queued local edits
    async fn push(&self) -> Result<PushSummary>;
}

#[async_trait]
impl<E: SyncEntity> TableSync for HybridRepository<E> {
    fn table(&self) -> Table {
        E::TABLE
    }

    async fn pull(
        &self,
        batch_size: u32,
        is_current: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<PullSummary> {
        self.pull_changes(batch_size, is_current).await
    }

    async fn push(&self) -> Result<PushSummary> {
        self.push_pending().await
    }
}

/// Currency reference data, replaced wholesale on every pull
pub struct CurrencySync {
    store: Arc<LocalStore>,
    client: Arc<dyn RemoteClient>,
}

impl CurrencySync {
    pub fn new(store: Arc<LocalStore>, client: Arc<dyn RemoteClient>) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl TableSync for CurrencySync {
    fn table(&self) -> Table {
        Table::Currencies
    }

    async fn pull(
        &self,
        _batch_size: u32,
        is_current: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<PullSummary> {
        let mut summary = PullSummary::default();
        let Some(handle) = self.store.ready().await else {
            return Ok(summary);
        };

        let currencies = self.client.list_currencies().await?;
        if !is_current() {
            summary.superseded = true;
            return Ok(summary);
        }

        let db = handle.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let replaced = CurrencyRepository::new(conn).replace_all(&currencies).await;
        finish(conn, replaced).await?;

        summary.applied = currencies.len();
        summary.batches = 1;
        Ok(summary)
    }

    async fn push(&self) -> Result<PushSummary> {
        Ok(PushSummary::default())
    }
}

/// Drives push and pull for a set of tables
pub struct SyncEngine {
    tables: Vec<Arc<dyn TableSync>>,
    generations: HashMap<Table, Arc<AtomicU64>>,
    batch_size: u32,
}

impl SyncEngine {
    pub fn new(batch_size: u32) -> Self {
        Self {
            tables: Vec::new(),
            generations: HashMap::new(),
            batch_size: batch_size.max(1),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: Arc<dyn TableSync>) -> Self {
        self.generations
            .entry(table.table())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        self.tables.push(table);
        self
    }

    pub const fn batch_size(&self) -> u32 {
        self.batch_size
    }

    fn find(&self, table: Table) -> Option<&Arc<dyn TableSync>> {
        self.tables.iter().find(|sync| sync.table() == table)
    }

    fn require(&self, table: Table) -> Result<&Arc<dyn TableSync>> {
        self.find(table)
            .ok_or_else(|| Error::InvalidInput(format!("{table} is not synced")))
    }

    /// Pull one table. Starting a pull invalidates any pull of the same
    /// table still in flight.
    pub async fn pull_table(&self, table: Table) -> Result<PullSummary> {
        let sync = self.require(table)?;
        let generation = self
            .generations
            .get(&table)
            .map(Arc::clone)
            .unwrap_or_default();
        let started = generation.fetch_add(1, Ordering::SeqCst) + 1;
        let is_current = move || generation.load(Ordering::SeqCst) == started;
        sync.pull(self.batch_size, &is_current).await
    }

    pub async fn push_table(&self, table: Table) -> Result<PushSummary> {
        self.require(table)?.push().await
    }

    /// Sweep every outbox, parents before children
    pub async fn push_all(&self) -> Result<PushSummary> {
        let mut total = PushSummary::default();
        for table in Table::PUSH_ORDER {
            if self.find(table).is_none() {
                continue;
            }
            let summary = self.push_table(table).await?;
            total.synced += summary.synced;
            total.conflicts += summary.conflicts;
            total.rejected += summary.rejected;
            total.failed += summary.failed;
        }
        Ok(total)
    }

    /// Push everything, then pull everything
    pub async fn sync_all(&self) -> SyncReport {
        let mut reports: Vec<TableReport> = Table::ALL
            .into_iter()
            .filter(|table| self.find(*table).is_some())
            .map(TableReport::new)
            .collect();

        for table in Table::PUSH_ORDER {
            let Some(report) = reports.iter_mut().find(|report| report.table == table) else {
                continue;
            };
            match self.push_table(table).await {
                Ok(summary) => report.pushed = summary,
                Err(error) => {
                    tracing::warn!("Push of {table} failed: {error}");
                    report.error = Some(error.to_string());
                }
            }
        }

        for report in &mut reports {
            let table = report.table;
            match self.pull_table(table).await {
                Ok(summary) => report.pulled = summary,
                Err(error) => {
                    tracing::warn!("Pull of {table} failed: {error}");
                    report.error.get_or_insert_with(|| error.to_string());
                }
            }
        }

        let report = SyncReport { tables: reports };
        tracing::info!(
            "Sync finished: {} pushed, {} pulled, {} conflicts",
            report.total_synced(),
            report.total_applied(),
            report.total_conflicts()
        );
        report
    }

    /// Run `sync_all` every `interval` until `shutdown` flips to true
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sync_all().await;
                        if report.has_errors() {
                            tracing::debug!("Periodic sync finished with errors");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Periodic sync stopped");
        })
    }
}

//! Wiring: one local store, one remote, four hybrid repositories sharing a
//! push gate, the sync engine and the service on top.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::LedgerConfig;
use crate::db::LocalStore;
use crate::error::Result;
use crate::remote::RemoteClient;
use crate::repository::{HybridRepository, PushGate, PushMode};
use crate::service::{
    AuthProvider, ConflictObserver, LedgerService, LogObserver, Repositories, StaticAuth,
};
use crate::sync::{CurrencySync, SyncEngine, DEFAULT_PULL_LIMIT};

/// Tuning knobs for [`Ledger::new`]
#[derive(Clone)]
pub struct LedgerOptions {
    pub push_mode: PushMode,
    pub pull_batch_size: u32,
    pub observer: Arc<dyn ConflictObserver>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            push_mode: PushMode::Background,
            pull_batch_size: DEFAULT_PULL_LIMIT,
            observer: Arc::new(LogObserver),
        }
    }
}

/// Running periodic sync; stop it with [`PeriodicSync::stop`]
pub struct PeriodicSync {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicSync {
    pub async fn stop(self) {
        // Receiver gone means the task already ended
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            tracing::warn!("Periodic sync task ended abnormally: {error}");
        }
    }
}

pub struct Ledger {
    store: Arc<LocalStore>,
    service: LedgerService,
    engine: Arc<SyncEngine>,
}

impl Ledger {
    pub fn new(
        store: Arc<LocalStore>,
        client: Arc<dyn RemoteClient>,
        auth: Arc<dyn AuthProvider>,
        options: LedgerOptions,
    ) -> Self {
        let gate = Arc::new(PushGate::new());
        let repos = Repositories {
            accounts: hybrid(&store, &client, &gate, &options),
            categories: hybrid(&store, &client, &gate, &options),
            transactions: hybrid(&store, &client, &gate, &options),
            inbox: hybrid(&store, &client, &gate, &options),
        };

        let engine = Arc::new(
            SyncEngine::new(options.pull_batch_size)
                .with_table(Arc::new(CurrencySync::new(
                    Arc::clone(&store),
                    Arc::clone(&client),
                )))
                .with_table(Arc::new(repos.categories.clone()))
                .with_table(Arc::new(repos.accounts.clone()))
                .with_table(Arc::new(repos.transactions.clone()))
                .with_table(Arc::new(repos.inbox.clone())),
        );

        let service = LedgerService::new(
            auth,
            options.observer,
            Arc::clone(&store),
            client,
            repos,
            Arc::clone(&engine),
        );

        Self {
            store,
            service,
            engine,
        }
    }

    /// Build everything from configuration
    pub fn from_config(config: &LedgerConfig) -> Result<Self> {
        let options = LedgerOptions {
            pull_batch_size: config.pull_batch_size,
            ..LedgerOptions::default()
        };
        Ok(Self::new(
            Arc::new(config.local_store()),
            config.remote_client()?,
            Arc::new(StaticAuth::new(config.user_id.clone())),
            options,
        ))
    }

    pub const fn service(&self) -> &LedgerService {
        &self.service
    }

    pub const fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub const fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Start `sync_all` on a fixed period
    pub fn spawn_periodic_sync(&self, interval: Duration) -> PeriodicSync {
        let (shutdown, receiver) = watch::channel(false);
        let handle = Arc::clone(&self.engine).spawn_periodic(interval, receiver);
        PeriodicSync { shutdown, handle }
    }

    /// Let background pushes finish, then release the local store
    pub async fn shutdown(&self) {
        self.service.wait_idle().await;
        self.store.close();
    }
}

fn hybrid<E: crate::models::SyncEntity>(
    store: &Arc<LocalStore>,
    client: &Arc<dyn RemoteClient>,
    gate: &Arc<PushGate>,
    options: &LedgerOptions,
) -> HybridRepository<E> {
    HybridRepository::new(Arc::clone(store), Arc::clone(client))
        .with_gate(Arc::clone(gate))
        .with_observer(Arc::clone(&options.observer))
        .with_push_mode(options.push_mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Query;
    use crate::error::Error;
    use crate::models::{AccountKind, CategoryKind, Resolution, SyncStatus, Table};
    use crate::remote::MemoryRemote;
    use pretty_assertions::assert_eq;

    fn device(remote: &Arc<MemoryRemote>) -> Ledger {
        Ledger::new(
            Arc::new(LocalStore::in_memory()),
            remote.clone(),
            Arc::new(StaticAuth::signed_in("alice")),
            LedgerOptions {
                push_mode: PushMode::Deferred,
                ..LedgerOptions::default()
            },
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstones_never_show_up_as_active() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = device(&remote);
        let service = ledger.service();

        let food = service
            .create_category("Food", CategoryKind::Expense, None)
            .await
            .unwrap();
        let rent = service
            .create_category("Rent", CategoryKind::Expense, None)
            .await
            .unwrap();
        ledger.engine().push_all().await.unwrap();
        service.delete_category(rent.meta.id.unwrap()).await.unwrap();

        let categories = &service.repositories().categories;
        let active = categories.list(&Query::active()).await.unwrap();
        let tombstones = categories.list(&Query::tombstones()).await.unwrap();

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].meta.id, food.meta.id);
        assert!(active.iter().all(|category| category.meta.deleted_at.is_none()));
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].meta.id, rent.meta.id);
        assert!(tombstones.iter().all(|category| category.meta.deleted_at.is_some()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_expected_version_reports_conflict_and_keeps_the_record() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = device(&remote);
        let categories = &ledger.service().repositories().categories;

        let saved = categories
            .save_confirmed(crate::models::Category::new("Food", CategoryKind::Expense))
            .await
            .unwrap();
        let id = saved.meta.id.unwrap();
        let before = remote.record(Table::Categories, id).unwrap();

        let mut edit = saved.clone();
        edit.name = "Groceries".to_string();
        let response = categories
            .remote()
            .write_response(&edit, saved.meta.version + 5)
            .await;

        assert!(!response.success);
        assert!(response.is_conflict());
        assert_eq!(remote.record(Table::Categories, id).unwrap(), before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn records_cross_devices_exactly_once() {
        let remote = Arc::new(MemoryRemote::new());
        let phone = device(&remote);
        let laptop = device(&remote);

        let account = phone
            .service()
            .create_account("Checking", AccountKind::Checking, "usd")
            .await
            .unwrap();
        let id = account.meta.id.unwrap();
        assert_eq!(account.currency_code, "USD");

        assert!(!phone.engine().sync_all().await.has_errors());
        assert!(!laptop.engine().sync_all().await.has_errors());
        let again = laptop.engine().sync_all().await;
        assert_eq!(again.table(Table::Accounts).unwrap().pulled.applied, 0);

        for ledger in [&phone, &laptop] {
            let accounts = ledger.service().list_accounts().await.unwrap();
            assert_eq!(accounts.len(), 1);
            assert_eq!(accounts[0].meta.id, Some(id));
            assert_eq!(accounts[0].meta.local_sync_status, SyncStatus::Synced);
        }
        assert_eq!(remote.record_count(Table::Accounts), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unavailable_store_creates_through_the_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(LocalStore::disabled());
        let ledger = Ledger::new(
            Arc::clone(&store),
            remote.clone(),
            Arc::new(StaticAuth::signed_in("alice")),
            LedgerOptions::default(),
        );

        let account = ledger
            .service()
            .create_account("Travel card", AccountKind::Credit, "EUR")
            .await
            .unwrap();
        let id = account.meta.id.unwrap();

        assert_eq!(account.meta.local_sync_status, SyncStatus::Synced);
        assert!(remote.record(Table::Accounts, id).is_some());
        assert!(store.ready().await.is_none());
        assert_eq!(ledger.service().status().await.unwrap()[1].pending, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_category_edits_retry_against_the_server_version() {
        let remote = Arc::new(MemoryRemote::new());
        let phone = device(&remote);
        let laptop = device(&remote);

        let food = phone
            .service()
            .create_category("Food", CategoryKind::Expense, None)
            .await
            .unwrap();
        let id = food.meta.id.unwrap();
        phone.engine().sync_all().await;
        laptop.engine().sync_all().await;

        phone.service().rename_category(id, "Groceries").await.unwrap();
        let renamed = laptop.service().rename_category(id, "Dining").await.unwrap();

        assert_eq!(renamed.name, "Dining");
        assert_eq!(renamed.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(renamed.meta.version, remote.current_version());
        assert_eq!(remote.record(Table::Categories, id).unwrap()["name"], "Dining");
        assert!(laptop.service().conflicts().await.unwrap().is_empty());

        phone.engine().sync_all().await;
        let seen = phone.service().repositories().categories.get(id).await.unwrap();
        assert_eq!(seen.unwrap().name, "Dining");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parked_conflicts_are_resolved_explicitly() {
        let remote = Arc::new(MemoryRemote::new());
        let phone = device(&remote);
        let laptop = device(&remote);

        let food = phone
            .service()
            .create_category("Food", CategoryKind::Expense, None)
            .await
            .unwrap();
        let id = food.meta.id.unwrap();
        phone.engine().sync_all().await;
        laptop.engine().sync_all().await;

        phone.service().rename_category(id, "Groceries").await.unwrap();

        // Queued offline edit on the laptop, pushed later by the sweep
        let categories = &laptop.service().repositories().categories;
        let mut stale = categories.get(id).await.unwrap().unwrap();
        stale.name = "Dining".to_string();
        categories.save(stale).await.unwrap();
        let report = laptop.engine().sync_all().await;
        assert_eq!(report.total_conflicts(), 1);

        let conflicts = laptop.service().conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].table, Table::Categories);

        let kept = laptop
            .service()
            .resolve(Table::Categories, id, Resolution::KeepRemote)
            .await
            .unwrap();
        assert!(kept);
        assert_eq!(categories.get(id).await.unwrap().unwrap().name, "Groceries");
        assert!(laptop.service().conflicts().await.unwrap().is_empty());

        let error = laptop
            .service()
            .resolve(Table::Currencies, id, Resolution::KeepLocal)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn category_with_children_is_deleted_after_reparenting() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = device(&remote);
        let service = ledger.service();

        let home = service
            .create_category("Home", CategoryKind::Expense, None)
            .await
            .unwrap();
        let home_id = home.meta.id.unwrap();
        let mut children = Vec::new();
        for name in ["Rent", "Utilities", "Repairs"] {
            let child = service
                .create_category(name, CategoryKind::Expense, Some(home_id))
                .await
                .unwrap();
            children.push(child.meta.id.unwrap());
        }
        ledger.engine().push_all().await.unwrap();
        assert_eq!(service.children_of(home_id).await.unwrap().len(), 3);

        let error = service.delete_category(home_id).await.unwrap_err();
        assert!(matches!(error, Error::HasDependents { child_count: 3, .. }));

        let nested = service
            .create_category("Deposit", CategoryKind::Expense, Some(children[0]))
            .await
            .unwrap_err();
        assert!(matches!(nested, Error::HierarchyViolation(_)));

        for child in &children {
            service.move_category(*child, None).await.unwrap();
        }
        let deleted = service.delete_category(home_id).await.unwrap();
        assert!(deleted.meta.deleted_at.is_some());
        assert!(!remote.record(Table::Categories, home_id).unwrap()["deleted_at"].is_null());
        assert_eq!(service.list_categories().await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_pull_is_refetched_on_the_next_run() {
        let remote = Arc::new(MemoryRemote::new());
        let phone = device(&remote);
        let laptop = device(&remote);

        for name in ["Food", "Rent"] {
            phone
                .service()
                .create_category(name, CategoryKind::Expense, None)
                .await
                .unwrap();
        }
        phone.engine().push_all().await.unwrap();

        remote.corrupt_next_pull(Table::Categories);
        assert!(laptop.engine().pull_table(Table::Categories).await.is_err());

        let status = laptop.service().status().await.unwrap();
        assert_eq!(status[0].table, Table::Categories);
        assert_eq!(status[0].watermark.last_synced_version, 0);
        assert!(laptop.service().list_categories().await.unwrap().is_empty());

        let retry = laptop.engine().pull_table(Table::Categories).await.unwrap();
        assert_eq!(retry.applied, 2);
        assert_eq!(retry.watermark, remote.current_version());
        let again = laptop.engine().pull_table(Table::Categories).await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(laptop.service().list_categories().await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_moves_transactions_to_the_target() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = device(&remote);
        let service = ledger.service();

        let account = service
            .create_account("Checking", AccountKind::Checking, "USD")
            .await
            .unwrap();
        let food = service
            .create_category("Food", CategoryKind::Expense, None)
            .await
            .unwrap();
        let snacks = service
            .create_category("Snacks", CategoryKind::Expense, None)
            .await
            .unwrap();
        let (food_id, snacks_id) = (food.meta.id.unwrap(), snacks.meta.id.unwrap());
        let spend = service
            .record_transaction(account.meta.id.unwrap(), -350, "Crisps", Some(snacks_id))
            .await
            .unwrap();
        ledger.engine().push_all().await.unwrap();

        let summary = service.merge_categories(&[snacks_id], food_id).await.unwrap();
        assert_eq!(summary.merged, 1);
        assert_eq!(summary.reassigned, 1);

        let moved = service.transactions_in_category(food_id).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].meta.id, spend.meta.id);
        let names: Vec<String> = service
            .list_categories()
            .await
            .unwrap()
            .into_iter()
            .map(|category| category.name)
            .collect();
        assert_eq!(names, vec!["Food".to_string()]);

        let refused = service.merge_categories(&[food_id], food_id).await.unwrap_err();
        assert!(matches!(refused, Error::Validation(_) | Error::Repository { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbox_items_become_transactions() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = device(&remote);
        let service = ledger.service();

        let account = service
            .create_account("Cash", AccountKind::Cash, "EUR")
            .await
            .unwrap();
        let account_id = account.meta.id.unwrap();
        let item = service.capture("Coffee", Some(-420)).await.unwrap();
        let untracked = service.capture("Parking", None).await.unwrap();
        assert_eq!(service.list_inbox().await.unwrap().len(), 2);

        let transaction = service
            .process_inbox_item(item.meta.id.unwrap(), account_id, None)
            .await
            .unwrap();
        assert_eq!(transaction.amount_cents, -420);
        assert_eq!(transaction.currency_code, "EUR");

        let missing_amount = service
            .process_inbox_item(untracked.meta.id.unwrap(), account_id, None)
            .await
            .unwrap_err();
        assert!(matches!(missing_amount, Error::Validation(_)));

        service.dismiss_inbox_item(untracked.meta.id.unwrap()).await.unwrap();
        assert!(service.list_inbox().await.unwrap().is_empty());

        ledger.engine().push_all().await.unwrap();
        let status = service.status().await.unwrap();
        assert!(status.iter().all(|table| table.pending == 0));
        assert_eq!(service.transactions_for_account(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mutations_require_a_signed_in_user() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = Ledger::new(
            Arc::new(LocalStore::in_memory()),
            remote,
            Arc::new(StaticAuth::anonymous()),
            LedgerOptions::default(),
        );

        let error = ledger
            .service()
            .create_account("Checking", AccountKind::Checking, "USD")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Unauthenticated));
        assert!(ledger.service().list_accounts().await.unwrap().is_empty());

        let blank = Ledger::new(
            Arc::new(LocalStore::in_memory()),
            Arc::new(MemoryRemote::new()),
            Arc::new(StaticAuth::signed_in("alice")),
            LedgerOptions::default(),
        );
        let error = blank
            .service()
            .create_category("   ", CategoryKind::Income, None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_config_keeps_writes_queued() {
        let config = LedgerConfig {
            user_id: Some("alice".to_string()),
            ..LedgerConfig::default()
        };
        let ledger = Ledger::from_config(&config).unwrap();

        ledger
            .service()
            .create_account("Checking", AccountKind::Checking, "USD")
            .await
            .unwrap();
        ledger.service().wait_idle().await;

        let accounts = ledger.service().status().await.unwrap()[1].clone();
        assert_eq!(accounts.table, Table::Accounts);
        assert_eq!(accounts.pending, 1);
        let report = ledger.engine().sync_all().await;
        assert!(report.has_errors());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_waits_for_children_queued_behind_their_parent() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = Ledger::new(
            Arc::new(LocalStore::in_memory()),
            remote.clone(),
            Arc::new(StaticAuth::signed_in("alice")),
            LedgerOptions::default(),
        );

        let account = ledger
            .service()
            .create_account("Checking", AccountKind::Checking, "USD")
            .await
            .unwrap();
        let spend = ledger
            .service()
            .record_transaction(account.meta.id.unwrap(), -900, "Taxi", None)
            .await
            .unwrap();
        ledger.shutdown().await;

        assert!(remote.record(Table::Accounts, account.meta.id.unwrap()).is_some());
        assert!(remote.record(Table::Transactions, spend.meta.id.unwrap()).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edits_of_a_parked_record_need_a_resolution_first() {
        let remote = Arc::new(MemoryRemote::new());
        let phone = device(&remote);
        let laptop = device(&remote);

        let food = phone
            .service()
            .create_category("Food", CategoryKind::Expense, None)
            .await
            .unwrap();
        let id = food.meta.id.unwrap();
        phone.engine().sync_all().await;
        laptop.engine().sync_all().await;
        phone.service().rename_category(id, "Groceries").await.unwrap();

        let categories = &laptop.service().repositories().categories;
        let mut stale = categories.get(id).await.unwrap().unwrap();
        stale.name = "Dining".to_string();
        categories.save(stale).await.unwrap();
        assert_eq!(laptop.engine().sync_all().await.total_conflicts(), 1);

        let error = laptop
            .service()
            .rename_category(id, "Eating out")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert_eq!(laptop.service().conflicts().await.unwrap().len(), 1);

        laptop
            .service()
            .resolve(Table::Categories, id, Resolution::KeepLocal)
            .await
            .unwrap();
        let renamed = laptop.service().rename_category(id, "Eating out").await.unwrap();
        assert_eq!(renamed.meta.local_sync_status, SyncStatus::Synced);
        assert_eq!(remote.record(Table::Categories, id).unwrap()["name"], "Eating out");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_sync_flushes_the_outbox() {
        let remote = Arc::new(MemoryRemote::new());
        let ledger = device(&remote);
        ledger
            .service()
            .capture("Lunch", Some(-1200))
            .await
            .unwrap();

        let periodic = ledger.spawn_periodic_sync(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        periodic.stop().await;

        assert_eq!(remote.record_count(Table::InboxItems), 1);
        ledger.shutdown().await;
        assert!(!ledger.store().is_ready());
    }
}

//! Ledger operations used by the CLI and any other front end.
//!
//! Mutations require a signed-in user. Creates are local-first and pushed
//! in the background; edits of existing records are pushed before returning
//! so a stale version can be retried once against the authoritative one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::{CurrencyRepository, Filter, LocalStore, Query};
use crate::error::{Error, Result};
use crate::models::{
    Account, AccountKind, Category, CategoryKind, Currency, EntityId, InboxItem, InboxStatus,
    Resolution, SyncConflict, SyncEntity, Table, Transaction,
};
use crate::remote::RemoteClient;
use crate::repository::{HybridRepository, WriteKind};
use crate::sync::{SyncEngine, TableStatus};
use crate::util::normalize_text_option;

use super::{with_version_retry, AuthProvider, ConflictObserver};

const MERGE_CATEGORIES_RPC: &str = "merge_categories";

/// The hybrid repositories of one ledger, sharing a store and a push gate
#[derive(Clone)]
pub struct Repositories {
    pub accounts: HybridRepository<Account>,
    pub categories: HybridRepository<Category>,
    pub transactions: HybridRepository<Transaction>,
    pub inbox: HybridRepository<InboxItem>,
}

/// Result of the server-side category merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    /// Source categories tombstoned
    #[serde(default)]
    pub merged: u32,
    /// Transactions and inbox items moved to the target
    #[serde(default)]
    pub reassigned: u32,
    #[serde(default)]
    pub version: i64,
}

pub struct LedgerService {
    auth: Arc<dyn AuthProvider>,
    observer: Arc<dyn ConflictObserver>,
    store: Arc<LocalStore>,
    client: Arc<dyn RemoteClient>,
    repos: Repositories,
    engine: Arc<SyncEngine>,
}

fn required_text(value: &str, field: &str) -> Result<String> {
    normalize_text_option(Some(value.to_string()))
        .ok_or_else(|| Error::Validation(format!("{field} must not be empty")))
}

impl LedgerService {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        observer: Arc<dyn ConflictObserver>,
        store: Arc<LocalStore>,
        client: Arc<dyn RemoteClient>,
        repos: Repositories,
        engine: Arc<SyncEngine>,
    ) -> Self {
        Self {
            auth,
            observer,
            store,
            client,
            repos,
            engine,
        }
    }

    pub const fn repositories(&self) -> &Repositories {
        &self.repos
    }

    fn require_user(&self) -> Result<String> {
        self.auth.current_user_id().ok_or(Error::Unauthenticated)
    }

    /// Apply `mutate` to the current record and push it, retrying once on a
    /// version conflict. A terminal conflict is reported to the observer.
    async fn update<E, F>(&self, repo: &HybridRepository<E>, id: EntityId, mutate: F) -> Result<E>
    where
        E: SyncEntity,
        F: Fn(&mut E) + Send + Sync,
    {
        self.require_user()?;
        let current = repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{}/{id}", E::TABLE)))?;

        let mut kind = WriteKind::Edit;
        let result = with_version_retry(
            current.meta().version,
            |version| {
                let mut next = current.clone();
                next.meta_mut().version = version;
                mutate(&mut next);
                let write = repo.write_confirmed(next, kind);
                kind = WriteKind::ConflictRetry;
                write
            },
            || repo.remote_version(id),
        )
        .await;

        if let Err(error) = &result {
            if error.is_conflict() {
                self.observer.on_conflict(E::TABLE, id, error);
            }
        }
        result
    }

    // Accounts

    pub async fn create_account(
        &self,
        name: &str,
        kind: AccountKind,
        currency_code: &str,
    ) -> Result<Account> {
        self.require_user()?;
        let name = required_text(name, "account name")?;
        let currency = required_text(currency_code, "currency code")?.to_ascii_uppercase();
        self.repos
            .accounts
            .save(Account::new(name, kind, currency))
            .await
    }

    pub async fn rename_account(&self, id: EntityId, name: &str) -> Result<Account> {
        let name = required_text(name, "account name")?;
        self.update(&self.repos.accounts, id, |account| account.name.clone_from(&name))
            .await
    }

    pub async fn set_account_archived(&self, id: EntityId, archived: bool) -> Result<Account> {
        self.update(&self.repos.accounts, id, |account| account.is_archived = archived)
            .await
    }

    pub async fn delete_account(&self, id: EntityId) -> Result<Account> {
        self.update(&self.repos.accounts, id, tombstone).await
    }

    pub async fn get_account(&self, id: EntityId) -> Result<Option<Account>> {
        self.repos.accounts.get(id).await
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.repos.accounts.list_active().await
    }

    // Categories

    async fn require_root(&self, parent: EntityId) -> Result<()> {
        let parent = self.repos.categories.get(parent).await?.ok_or_else(|| {
            Error::HierarchyViolation(format!("parent category {parent} does not exist"))
        })?;
        if parent.is_root() {
            Ok(())
        } else {
            Err(Error::HierarchyViolation(
                "categories nest only one level deep".to_string(),
            ))
        }
    }

    async fn active_children(&self, id: EntityId) -> Result<u32> {
        let count = self
            .repos
            .categories
            .count(&Query::active().with(Filter::references("parent_id", id)))
            .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub async fn create_category(
        &self,
        name: &str,
        kind: CategoryKind,
        parent: Option<EntityId>,
    ) -> Result<Category> {
        self.require_user()?;
        let name = required_text(name, "category name")?;
        let mut category = Category::new(name, kind);
        if let Some(parent) = parent {
            self.require_root(parent).await?;
            category = category.with_parent(parent);
        }
        self.repos.categories.save(category).await
    }

    pub async fn rename_category(&self, id: EntityId, name: &str) -> Result<Category> {
        let name = required_text(name, "category name")?;
        self.update(&self.repos.categories, id, |category| {
            category.name.clone_from(&name);
        })
        .await
    }

    /// Reparent a category, or make it top-level with `None`
    pub async fn move_category(&self, id: EntityId, parent: Option<EntityId>) -> Result<Category> {
        if let Some(parent) = parent {
            if parent == id {
                return Err(Error::HierarchyViolation(
                    "a category cannot be its own parent".to_string(),
                ));
            }
            self.require_root(parent).await?;
            if self.active_children(id).await? > 0 {
                return Err(Error::HierarchyViolation(
                    "a category with subcategories cannot be nested".to_string(),
                ));
            }
        }
        self.update(&self.repos.categories, id, |category| category.parent_id = parent)
            .await
    }

    /// Tombstone a category. Refused while it still has active children.
    pub async fn delete_category(&self, id: EntityId) -> Result<Category> {
        let child_count = self.active_children(id).await?;
        if child_count > 0 {
            return Err(Error::HasDependents {
                child_count,
                message: format!("category {id} has active subcategories"),
            });
        }
        self.update(&self.repos.categories, id, tombstone).await
    }

    pub async fn children_of(&self, id: EntityId) -> Result<Vec<Category>> {
        self.repos
            .categories
            .list(&Query::active().with(Filter::references("parent_id", id)))
            .await
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        self.repos.categories.list_active().await
    }

    /// Merge `sources` into `target` on the server in one step, then pull
    /// every table the merge touched
    pub async fn merge_categories(
        &self,
        sources: &[EntityId],
        target: EntityId,
    ) -> Result<MergeSummary> {
        self.require_user()?;
        if sources.is_empty() {
            return Err(Error::Validation("nothing to merge".to_string()));
        }

        let args = json!({
            "source_ids": sources.iter().map(EntityId::as_str).collect::<Vec<_>>(),
            "target_id": target.as_str(),
        });
        let outcome = self.client.rpc(MERGE_CATEGORIES_RPC, args).await?;
        let summary: MergeSummary = serde_json::from_value(outcome)?;
        tracing::info!(
            "Merged {} categories into {target}, {} records reassigned",
            summary.merged,
            summary.reassigned
        );

        for table in [Table::Categories, Table::Transactions, Table::InboxItems] {
            if let Err(error) = self.engine.pull_table(table).await {
                tracing::warn!("Pull of {table} after merge failed: {error}");
            }
        }
        Ok(summary)
    }

    // Transactions

    pub async fn record_transaction(
        &self,
        account_id: EntityId,
        amount_cents: i64,
        description: &str,
        category_id: Option<EntityId>,
    ) -> Result<Transaction> {
        self.require_user()?;
        let description = required_text(description, "description")?;
        let account = self
            .repos
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("accounts/{account_id}")))?;

        let mut transaction =
            Transaction::new(account_id, amount_cents, account.currency_code, description);
        if let Some(category_id) = category_id {
            if self.repos.categories.get(category_id).await?.is_none() {
                return Err(Error::NotFound(format!("categories/{category_id}")));
            }
            transaction = transaction.with_category(category_id);
        }
        self.repos.transactions.save(transaction).await
    }

    pub async fn recategorize_transaction(
        &self,
        id: EntityId,
        category_id: Option<EntityId>,
    ) -> Result<Transaction> {
        self.update(&self.repos.transactions, id, |transaction| {
            transaction.category_id = category_id;
        })
        .await
    }

    pub async fn delete_transaction(&self, id: EntityId) -> Result<Transaction> {
        self.update(&self.repos.transactions, id, tombstone).await
    }

    pub async fn transactions_for_account(&self, account_id: EntityId) -> Result<Vec<Transaction>> {
        self.repos
            .transactions
            .list(&Query::active().with(Filter::references("account_id", account_id)))
            .await
    }

    pub async fn transactions_in_category(
        &self,
        category_id: EntityId,
    ) -> Result<Vec<Transaction>> {
        self.repos
            .transactions
            .list(&Query::active().with(Filter::references("category_id", category_id)))
            .await
    }

    pub async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        self.repos.transactions.list_active().await
    }

    // Inbox

    pub async fn capture(&self, description: &str, amount_cents: Option<i64>) -> Result<InboxItem> {
        self.require_user()?;
        let mut item = InboxItem::new(required_text(description, "description")?);
        item.amount_cents = amount_cents;
        self.repos.inbox.save(item).await
    }

    /// Items still waiting for triage
    pub async fn list_inbox(&self) -> Result<Vec<InboxItem>> {
        self.repos
            .inbox
            .list(&Query::active().with(Filter::Eq("status", json!("unprocessed"))))
            .await
    }

    pub async fn dismiss_inbox_item(&self, id: EntityId) -> Result<InboxItem> {
        self.update(&self.repos.inbox, id, |item| item.status = InboxStatus::Dismissed)
            .await
    }

    /// Turn a captured item into a posted transaction
    pub async fn process_inbox_item(
        &self,
        id: EntityId,
        account_id: EntityId,
        category_id: Option<EntityId>,
    ) -> Result<Transaction> {
        let item = self
            .repos
            .inbox
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("inbox_items/{id}")))?;
        if item.status != InboxStatus::Unprocessed {
            return Err(Error::Validation(format!("inbox item {id} was already triaged")));
        }
        let amount = item
            .amount_cents
            .ok_or_else(|| Error::Validation("inbox item has no amount".to_string()))?;

        let transaction = self
            .record_transaction(
                account_id,
                amount,
                &item.description,
                category_id.or(item.category_id),
            )
            .await?;
        self.update(&self.repos.inbox, id, |item| {
            item.status = InboxStatus::Processed;
            item.account_id = Some(account_id);
            item.category_id = transaction.category_id;
        })
        .await?;
        Ok(transaction)
    }

    // Reference data and sync state

    /// Cached currencies, falling back to the remote list
    pub async fn list_currencies(&self) -> Result<Vec<Currency>> {
        if let Some(handle) = self.store.ready().await {
            let db = handle.lock().await;
            let cached = CurrencyRepository::new(db.connection()).list().await?;
            if !cached.is_empty() {
                return Ok(cached);
            }
        }
        Ok(self.client.list_currencies().await?)
    }

    pub async fn conflicts(&self) -> Result<Vec<SyncConflict>> {
        let mut conflicts = self.repos.categories.list_conflicts().await?;
        conflicts.extend(self.repos.accounts.list_conflicts().await?);
        conflicts.extend(self.repos.transactions.list_conflicts().await?);
        conflicts.extend(self.repos.inbox.list_conflicts().await?);
        Ok(conflicts)
    }

    /// Explicitly resolve a parked record; returns whether it still exists
    pub async fn resolve(&self, table: Table, id: EntityId, resolution: Resolution) -> Result<bool> {
        self.require_user()?;
        let remaining = match table {
            Table::Accounts => self.repos.accounts.resolve_conflict(id, resolution).await?.is_some(),
            Table::Categories => {
                self.repos.categories.resolve_conflict(id, resolution).await?.is_some()
            }
            Table::Transactions => {
                self.repos.transactions.resolve_conflict(id, resolution).await?.is_some()
            }
            Table::InboxItems => self.repos.inbox.resolve_conflict(id, resolution).await?.is_some(),
            Table::Currencies => {
                return Err(Error::InvalidInput("currencies never conflict".to_string()))
            }
        };
        Ok(remaining)
    }

    pub async fn status(&self) -> Result<Vec<TableStatus>> {
        Ok(vec![
            self.repos.categories.sync_status().await?,
            self.repos.accounts.sync_status().await?,
            self.repos.transactions.sync_status().await?,
            self.repos.inbox.sync_status().await?,
        ])
    }

    /// Wait for background pushes started by this service
    pub async fn wait_idle(&self) {
        self.repos.categories.wait_idle().await;
        self.repos.accounts.wait_idle().await;
        self.repos.transactions.wait_idle().await;
        self.repos.inbox.wait_idle().await;
    }
}

fn tombstone<E: SyncEntity>(entity: &mut E) {
    entity.meta_mut().deleted_at = Some(crate::util::now_millis());
}

//! Data models for Ledger

mod account;
mod category;
mod currency;
mod id;
mod inbox_item;
pub(crate) mod sync_meta;
mod sync_conflict;
mod sync_state;
mod table;
mod transaction;

pub use account::{Account, AccountKind};
pub use category::{Category, CategoryKind};
pub use currency::Currency;
pub use id::EntityId;
pub use inbox_item::{InboxItem, InboxStatus};
pub use sync_conflict::{Resolution, SyncConflict};
pub use sync_meta::{RowReader, SyncEntity, SyncMeta, SyncStatus};
pub use sync_state::SyncWatermark;
pub use table::Table;
pub use transaction::Transaction;

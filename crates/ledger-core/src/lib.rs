//! ledger-core - Core library for Ledger
//!
//! This crate contains the models, the local store, the hybrid repositories
//! and the delta sync engine used by every Ledger front end. Writes land in
//! the local store first and reach the remote authority through a push
//! outbox; pulls apply remote changes above a per-table version watermark.

pub mod config;
pub mod db;
pub mod error;
mod ledger;
pub mod models;
pub mod remote;
pub mod repository;
pub mod service;
pub mod sync;
pub mod util;

pub use config::LedgerConfig;
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerOptions, PeriodicSync};
pub use models::{
    Account, AccountKind, Category, CategoryKind, Currency, EntityId, InboxItem, InboxStatus,
    Resolution, SyncConflict, SyncStatus, Table, Transaction,
};
pub use repository::{HybridRepository, PushMode};
pub use service::{AuthProvider, ConflictObserver, LedgerService, StaticAuth};
pub use sync::{SyncEngine, SyncReport};

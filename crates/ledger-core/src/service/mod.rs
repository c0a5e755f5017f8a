//! Service layer: auth context, conflict policy and ledger operations

mod auth;
mod conflict;
mod ledger;

pub use auth::{AuthProvider, StaticAuth};
pub use conflict::{with_version_retry, ConflictObserver, LogObserver};
pub use ledger::{LedgerService, MergeSummary, Repositories};

//! Local database layer for Ledger

mod connection;
mod currencies;
mod local;
pub mod migrations;
mod outbox;
pub mod query;
mod store;
mod sync_metadata;

pub use connection::Database;
pub use currencies::CurrencyRepository;
pub use local::LocalRepository;
pub use outbox::{OutboxEntry, OutboxRepository};
pub use query::{new_entity_id, Filter, Order, Query};
pub use store::{LocalHandle, LocalStore, RuntimeContext, StoreLocation, StoreState};
pub use sync_metadata::SyncMetadataRepository;

use crate::error::Result;
use libsql::Connection;

/// Start an explicit transaction on the shared connection
pub(crate) async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;
    Ok(())
}

/// Commit on success, roll back on failure, and hand the result through
pub(crate) async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", ()).await?;
            Ok(value)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}

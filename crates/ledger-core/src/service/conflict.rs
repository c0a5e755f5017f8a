//! Version-conflict retry policy and terminal conflict notification

use std::future::Future;

use crate::error::{Error, Result};
use crate::models::{EntityId, Table};

/// Notified when a write cannot be reconciled automatically
pub trait ConflictObserver: Send + Sync {
    /// A record is parked in `conflict` and needs an explicit resolution
    fn on_conflict(&self, table: Table, id: EntityId, error: &Error);

    /// The remote refused a write for good and the local edit was reverted
    fn on_rejected(&self, table: Table, id: EntityId, error: &Error) {
        let _ = (table, id, error);
    }
}

/// Default observer: log and move on
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ConflictObserver for LogObserver {
    fn on_conflict(&self, table: Table, id: EntityId, error: &Error) {
        tracing::warn!("{table}/{id} needs resolution: {error}");
    }

    fn on_rejected(&self, table: Table, id: EntityId, error: &Error) {
        tracing::warn!("{table}/{id} was rejected and reverted: {error}");
    }
}

/// Run a version-guarded write with at most one retry.
///
/// `attempt` receives the expected version. On a conflict, `refresh` fetches
/// the authoritative version once and the write is retried exactly once with
/// it. A second conflict is returned as the terminal `VersionConflict`. Any
/// other error is returned immediately without retrying.
pub async fn with_version_retry<T, A, AF, R, RF>(
    expected_version: i64,
    mut attempt: A,
    refresh: R,
) -> Result<T>
where
    A: FnMut(i64) -> AF,
    AF: Future<Output = Result<T>>,
    R: FnOnce() -> RF,
    RF: Future<Output = Result<i64>>,
{
    match attempt(expected_version).await {
        Err(error) if error.is_conflict() => {
            let current = refresh().await?;
            tracing::debug!("Retrying write at version {current} after conflict at {expected_version}");
            attempt(current).await
        }
        other => other,
    }
}

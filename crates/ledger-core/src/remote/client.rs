//! Remote client seam.
//!
//! Everything above this trait works against JSON records and
//! [`RemoteError`]s, so the HTTP backend and the in-process one are
//! interchangeable.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::db::Query;
use crate::models::{Currency, EntityId, Table};
use crate::sync::{DeltaRequest, DeltaResponse};

use super::RemoteError;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Typed CRUD, RPC and delta calls against the authoritative backend
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// One record by id, tombstones included
    async fn fetch(&self, table: Table, id: EntityId) -> RemoteResult<Option<JsonValue>>;

    /// Records matching `query`. Local-only predicates are ignored.
    async fn select(&self, table: Table, query: &Query) -> RemoteResult<Vec<JsonValue>>;

    /// Version-guarded upsert.
    ///
    /// `expected_version` 0 means the record must not exist yet. On success
    /// the stored record comes back with its new server version.
    async fn write(
        &self,
        table: Table,
        record: JsonValue,
        expected_version: i64,
    ) -> RemoteResult<JsonValue>;

    async fn changes_since(&self, request: &DeltaRequest) -> RemoteResult<DeltaResponse<JsonValue>>;

    /// Opaque server-side operation, all-or-nothing from the client's view
    async fn rpc(&self, name: &str, args: JsonValue) -> RemoteResult<JsonValue>;

    async fn list_currencies(&self) -> RemoteResult<Vec<Currency>>;
}

/// A remote that is never reachable.
///
/// Used when no backend is configured: local writes stay queued in the
/// outbox and reads are served locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineRemote;

impl OfflineRemote {
    fn error() -> RemoteError {
        RemoteError::unreachable("no remote configured")
    }
}

#[async_trait]
impl RemoteClient for OfflineRemote {
    async fn fetch(&self, _table: Table, _id: EntityId) -> RemoteResult<Option<JsonValue>> {
        Err(Self::error())
    }

    async fn select(&self, _table: Table, _query: &Query) -> RemoteResult<Vec<JsonValue>> {
        Err(Self::error())
    }

    async fn write(
        &self,
        _table: Table,
        _record: JsonValue,
        _expected_version: i64,
    ) -> RemoteResult<JsonValue> {
        Err(Self::error())
    }

    async fn changes_since(
        &self,
        _request: &DeltaRequest,
    ) -> RemoteResult<DeltaResponse<JsonValue>> {
        Err(Self::error())
    }

    async fn rpc(&self, _name: &str, _args: JsonValue) -> RemoteResult<JsonValue> {
        Err(Self::error())
    }

    async fn list_currencies(&self) -> RemoteResult<Vec<Currency>> {
        Err(Self::error())
    }
}

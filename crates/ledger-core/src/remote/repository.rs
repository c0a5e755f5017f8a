//! Typed remote repository

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::db::Query;
use crate::error::{Error, Result};
use crate::models::{EntityId, SyncEntity};
use crate::sync::{DeltaRequest, DeltaResponse};

use super::{RemoteClient, RemoteError, RemoteResult};

/// Write-result contract: `{success, data?, error?, conflict?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse<T> {
    pub success: bool,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<bool>,
}

impl<T> WriteResponse<T> {
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            conflict: None,
        }
    }

    pub fn failed(error: RemoteError) -> Self {
        let conflict = error.conflict.then_some(true);
        Self {
            success: false,
            data: None,
            error: Some(error),
            conflict,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict.unwrap_or(false)
    }

    /// Wire result → client result; the top-level conflict flag is folded
    /// into the error
    pub fn into_remote_result(self) -> RemoteResult<T> {
        let conflict = self.is_conflict();
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (true, None, _) => Err(RemoteError::unreachable("write succeeded without data")),
            (false, _, error) => {
                let mut error = error.unwrap_or_else(|| {
                    RemoteError::unreachable("write failed without an error body")
                });
                error.conflict |= conflict;
                Err(error)
            }
        }
    }

    pub fn into_result(self) -> Result<T> {
        self.into_remote_result().map_err(Error::from)
    }
}

impl<T> From<RemoteResult<T>> for WriteResponse<T> {
    fn from(result: RemoteResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::failed(error),
        }
    }
}

/// Decode a backend record into an entity
pub fn decode<T: DeserializeOwned>(record: JsonValue) -> Result<T> {
    Ok(serde_json::from_value(record)?)
}

/// CRUD for one entity type against the remote authority.
///
/// Every failure comes back as a typed [`Error`]; nothing here panics or
/// retries.
pub struct RemoteRepository<E> {
    client: Arc<dyn RemoteClient>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for RemoteRepository<E> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            _entity: PhantomData,
        }
    }
}

impl<E: SyncEntity> RemoteRepository<E> {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self {
            client,
            _entity: PhantomData,
        }
    }

    pub fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }

    /// Active record by id
    pub async fn get(&self, id: EntityId) -> Result<Option<E>> {
        Ok(self
            .get_any(id)
            .await?
            .filter(|record| record.meta().is_active()))
    }

    /// Record by id, tombstoned or not
    pub async fn get_any(&self, id: EntityId) -> Result<Option<E>> {
        self.client
            .fetch(E::TABLE, id)
            .await?
            .map(decode)
            .transpose()
    }

    /// Authoritative version of a record
    pub async fn current_version(&self, id: EntityId) -> Result<i64> {
        self.get_any(id)
            .await?
            .map(|record| record.meta().version)
            .ok_or_else(|| Error::NotFound(format!("{}/{id}", E::TABLE)))
    }

    pub async fn list(&self, query: &Query) -> Result<Vec<E>> {
        self.client
            .select(E::TABLE, query)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Version-guarded write; returns the stored record
    pub async fn write(&self, entity: &E, expected_version: i64) -> Result<E> {
        let record = serde_json::to_value(entity)?;
        let stored = self
            .client
            .write(E::TABLE, record, expected_version)
            .await?;
        decode(stored)
    }

    /// Same as [`Self::write`] but in the wire result shape
    pub async fn write_response(&self, entity: &E, expected_version: i64) -> WriteResponse<E> {
        match self.write(entity, expected_version).await {
            Ok(stored) => WriteResponse::ok(stored),
            Err(error) => {
                let conflict = error.is_conflict();
                WriteResponse {
                    success: false,
                    data: None,
                    error: Some(RemoteError {
                        conflict,
                        ..RemoteError::unreachable(error.to_string())
                    }),
                    conflict: Some(conflict),
                }
            }
        }
    }

    /// Raw delta; records are decoded by the caller while applying
    pub async fn changes_since(
        &self,
        since_version: i64,
        limit: u32,
    ) -> Result<DeltaResponse<JsonValue>> {
        let request = DeltaRequest::new(E::TABLE, since_version).with_limit(limit);
        Ok(self.client.changes_since(&request).await?)
    }
}

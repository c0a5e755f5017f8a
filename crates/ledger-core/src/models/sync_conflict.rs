//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::{EntityId, Table};

/// A record parked in `conflict` waiting for explicit resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Table holding the record
    pub table: Table,
    /// Record involved in the conflict
    pub entity_id: EntityId,
    /// Last version this device saw acknowledged
    pub local_version: i64,
    /// Server-reported reason
    pub reason: Option<String>,
    /// Local edit timestamp (unix ms)
    pub updated_at: i64,
}

/// How to leave the `conflict` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Re-push the local edit on top of the current server version
    KeepLocal,
    /// Drop the local edit and adopt the server record
    KeepRemote,
}

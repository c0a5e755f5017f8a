//! Per-table sync watermark model

use serde::{Deserialize, Serialize};

use super::Table;

/// Highest remote version fully applied locally for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub table: Table,
    /// Only ever advanced after a batch is committed
    pub last_synced_version: i64,
    /// When the watermark last moved (unix ms), `None` before the first pull
    pub last_synced_at: Option<i64>,
}

impl SyncWatermark {
    /// Watermark of a table that was never pulled
    #[must_use]
    pub const fn initial(table: Table) -> Self {
        Self {
            table,
            last_synced_version: 0,
            last_synced_at: None,
        }
    }
}

//! Outcome summaries for pull, push and full sync runs

use serde::Serialize;

use crate::models::{SyncWatermark, Table};

/// Result of pulling one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    /// Rows written into the local store
    pub applied: usize,
    /// Rows ignored because the local copy was newer or had unpushed edits
    pub skipped: usize,
    pub batches: usize,
    /// Watermark after the pull
    pub watermark: i64,
    /// A newer pull for the same table started; this one was discarded
    pub superseded: bool,
}

/// Result of pushing one table's outbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub synced: usize,
    pub conflicts: usize,
    pub rejected: usize,
    /// Transient failures left queued for the next sweep
    pub failed: usize,
}

impl PushSummary {
    pub const fn attempted(&self) -> usize {
        self.synced + self.conflicts + self.rejected + self.failed
    }
}

/// Per-table slice of a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: Table,
    pub pushed: PushSummary,
    pub pulled: PullSummary,
    /// Error that stopped this table; other tables still ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            pushed: PushSummary::default(),
            pulled: PullSummary::default(),
            error: None,
        }
    }
}

/// Result of `SyncEngine::sync_all`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub tables: Vec<TableReport>,
}

impl SyncReport {
    pub fn table(&self, table: Table) -> Option<&TableReport> {
        self.tables.iter().find(|report| report.table == table)
    }

    pub fn total_applied(&self) -> usize {
        self.tables.iter().map(|report| report.pulled.applied).sum()
    }

    pub fn total_synced(&self) -> usize {
        self.tables.iter().map(|report| report.pushed.synced).sum()
    }

    pub fn total_conflicts(&self) -> usize {
        self.tables.iter().map(|report| report.pushed.conflicts).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.tables.iter().any(|report| report.error.is_some())
    }
}

/// Point-in-time sync health of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub table: Table,
    /// Records waiting in the outbox
    pub pending: i64,
    /// Records parked until explicitly resolved
    pub conflicts: i64,
    pub watermark: SyncWatermark,
}

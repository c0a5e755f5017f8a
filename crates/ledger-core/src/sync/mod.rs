//! Delta sync: wire contract, orchestration and run reports

mod engine;
mod protocol;
mod report;

pub use engine::{CurrencySync, SyncEngine, TableSync};
pub use protocol::{DeltaRequest, DeltaResponse, DEFAULT_PULL_LIMIT};
pub use report::{PullSummary, PushSummary, SyncReport, TableReport, TableStatus};

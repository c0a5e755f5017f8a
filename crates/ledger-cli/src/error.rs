use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] ledger_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Invalid amount '{0}': use major units like 12.50 or -3")]
    InvalidAmount(String),
    #[error("Description cannot be empty")]
    EmptyDescription,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Refusing to reset the local database without --yes")]
    ResetNotConfirmed,
}

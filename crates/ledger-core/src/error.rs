//! Error types for ledger-core

use thiserror::Error;

/// Result type alias using ledger-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ledger-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Record does not exist (or is tombstoned)
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Record rejected by a backend constraint
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Category parent/child rules were violated
    #[error("Hierarchy violation: {0}")]
    HierarchyViolation(String),

    /// Record still has active dependents and cannot be deleted
    #[error("Record has {child_count} active dependents: {message}")]
    HasDependents { child_count: u32, message: String },

    /// Name already taken within its scope
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// Unmapped backend or transport failure, keeps the original code
    #[error("Repository error{}: {message}", code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Repository {
        code: Option<String>,
        message: String,
    },

    /// Local store is degraded; callers normally never see this
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),

    /// No authenticated user in the current context
    #[error("Not authenticated")]
    Unauthenticated,

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a generic repository error without a backend code
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            code: None,
            message: message.into(),
        }
    }

    /// Whether this is an optimistic-concurrency rejection
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict(_))
    }

    /// Whether the remote authority refused the write for good.
    ///
    /// Retrying the same payload cannot succeed, so local state is reverted
    /// instead of queued for another push.
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Validation(_)
                | Self::HierarchyViolation(_)
                | Self::HasDependents { .. }
                | Self::DuplicateName(_)
        )
    }
}

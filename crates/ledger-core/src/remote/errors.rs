//! Backend error codes and their translation into domain errors.
//!
//! [`ERROR_CODES`] is the only place a backend code is interpreted. Codes it
//! does not list become [`Error::Repository`] with the original code and
//! message kept for diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::util::compact_text;

/// Closed set of domain failures a backend code can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    VersionConflict,
    Validation,
    HierarchyViolation,
    HasDependents,
    DuplicateName,
}

/// Backend code → domain failure
pub const ERROR_CODES: &[(&str, ErrorKind)] = &[
    // PostgREST: zero rows where exactly one was expected
    ("PGRST116", ErrorKind::NotFound),
    ("P0002", ErrorKind::NotFound),
    ("VERSION_CONFLICT", ErrorKind::VersionConflict),
    // serialization_failure
    ("40001", ErrorKind::VersionConflict),
    // check_violation
    ("23514", ErrorKind::Validation),
    // invalid_parameter_value
    ("22023", ErrorKind::Validation),
    ("23502", ErrorKind::Validation),
    ("HIERARCHY_VIOLATION", ErrorKind::HierarchyViolation),
    ("HAS_DEPENDENTS", ErrorKind::HasDependents),
    // foreign_key_violation, raised when deleting a referenced row
    ("23503", ErrorKind::HasDependents),
    // unique_violation
    ("23505", ErrorKind::DuplicateName),
];

/// Look up a backend code
pub fn kind_for_code(code: &str) -> Option<ErrorKind> {
    ERROR_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, kind)| *kind)
}

/// Error body returned by the backend: `{code, message, details, hint}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Optimistic-concurrency rejection, regardless of code
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            details: None,
            hint: None,
            conflict: false,
        }
    }

    /// Transport-level failure with no backend code (offline, timeout, ...)
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
            hint: None,
            conflict: false,
        }
    }

    /// Version mismatch on a guarded write
    pub fn version_conflict(message: impl Into<String>) -> Self {
        Self {
            conflict: true,
            ..Self::new("VERSION_CONFLICT", message)
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    fn child_count(&self) -> u32 {
        self.details
            .as_ref()
            .and_then(|details| details.get("child_count"))
            .and_then(JsonValue::as_u64)
            .map_or(0, |count| u32::try_from(count).unwrap_or(u32::MAX))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", compact_text(&self.message)),
            None => f.write_str(&compact_text(&self.message)),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(error: RemoteError) -> Self {
        let kind = if error.conflict {
            Some(ErrorKind::VersionConflict)
        } else {
            error.code.as_deref().and_then(kind_for_code)
        };

        match kind {
            Some(ErrorKind::NotFound) => Self::NotFound(error.message),
            Some(ErrorKind::VersionConflict) => Self::VersionConflict(error.message),
            Some(ErrorKind::Validation) => Self::Validation(error.message),
            Some(ErrorKind::HierarchyViolation) => Self::HierarchyViolation(error.message),
            Some(ErrorKind::HasDependents) => Self::HasDependents {
                child_count: error.child_count(),
                message: error.message,
            },
            Some(ErrorKind::DuplicateName) => Self::DuplicateName(error.message),
            None => Self::Repository {
                code: error.code,
                message: error.message,
            },
        }
    }
}

//! Authentication context consumed by the service layer

/// Supplies the signed-in user, if any
pub trait AuthProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Fixed identity, e.g. from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticAuth {
    user_id: Option<String>,
}

impl StaticAuth {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: crate::util::normalize_text_option(user_id),
        }
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self::new(Some(user_id.into()))
    }

    pub const fn anonymous() -> Self {
        Self { user_id: None }
    }
}

impl AuthProvider for StaticAuth {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

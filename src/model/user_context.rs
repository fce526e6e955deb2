use serde::{Deserialize, Serialize};

/// Identity of the caller, recorded as author on every revision and audit action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub user_name: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: None,
        }
    }

    pub fn with_name(user_id: impl Into<String>, user_name: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name,
        }
    }

    /// Author used by seeding and other internal operations
    pub fn system() -> Self {
        Self::with_name("system", Some("System".to_string()))
    }

    /// Author used when a request carries no identity headers
    pub fn unknown_user() -> Self {
        Self::with_name("unknown-user", Some("Unknown User".to_string()))
    }

    pub fn author_id(&self) -> &str {
        &self.user_id
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::unknown_user()
    }
}

use thiserror::Error;

/// Raised by a storage gateway when the advisory lock token presented at save
/// time no longer matches the parent's current lock version.
#[derive(Debug, Error)]
#[error("Concurrent modification of '{parent_uid}' detected, reload and retry")]
pub struct LockConflict {
    pub parent_uid: String,
}

/// Domain error taxonomy surfaced unchanged to the API boundary.
#[derive(Debug, Error)]
pub enum MdrError {
    /// A caller-supplied value breaks a structural or business rule.
    #[error("{0}")]
    Validation(String),

    /// A precondition on domain state is violated.
    #[error("{0}")]
    BusinessLogic(String),

    /// A state transition was requested from an illegal source state.
    #[error("{msg}")]
    Versioning {
        msg: String,
        status: u16,
        code: &'static str,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// Two sessions raced for the same parent lock.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(anyhow::Error),
}

pub type MdrResult<T> = Result<T, MdrError>;

impl From<anyhow::Error> for MdrError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<LockConflict>() {
            Some(conflict) => MdrError::Conflict(conflict.to_string()),
            None => MdrError::Storage(err),
        }
    }
}

impl MdrError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MdrError::Validation(msg.into())
    }

    pub fn business(msg: impl Into<String>) -> Self {
        MdrError::BusinessLogic(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        MdrError::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        MdrError::AlreadyExists(msg.into())
    }

    /// Versioning failure with the default 400 / `invalid_status` code.
    pub fn versioning(msg: impl Into<String>) -> Self {
        MdrError::Versioning {
            msg: msg.into(),
            status: 400,
            code: "invalid_status",
        }
    }

    pub fn versioning_with(msg: impl Into<String>, status: u16, code: &'static str) -> Self {
        MdrError::Versioning {
            msg: msg.into(),
            status,
            code,
        }
    }

    /// Only storage-level lock races may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MdrError::Conflict(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            MdrError::Validation(_) | MdrError::BusinessLogic(_) => 400,
            MdrError::Versioning { status, .. } => *status,
            MdrError::NotFound(_) => 404,
            MdrError::AlreadyExists(_) | MdrError::Conflict(_) => 409,
            MdrError::Storage(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MdrError::Validation(_) => "validation_error",
            MdrError::BusinessLogic(_) => "business_logic_error",
            MdrError::Versioning { code, .. } => code,
            MdrError::NotFound(_) => "not_found",
            MdrError::AlreadyExists(_) => "already_exists",
            MdrError::Conflict(_) => "conflict",
            MdrError::Storage(_) => "internal_error",
        }
    }
}

/// Fails with a validation error when `cond` holds.
pub fn validation_if(cond: bool, msg: impl FnOnce() -> String) -> MdrResult<()> {
    if cond {
        return Err(MdrError::Validation(msg()));
    }
    Ok(())
}

/// Fails with a business-logic error when `cond` holds.
pub fn business_if(cond: bool, msg: impl FnOnce() -> String) -> MdrResult<()> {
    if cond {
        return Err(MdrError::BusinessLogic(msg()));
    }
    Ok(())
}

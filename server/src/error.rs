//! Shared error taxonomy for the ticket engine.
//!
//! Callers (the HTTP layer, admin tooling) receive one of these kinds with a
//! short machine-readable code and a one-sentence message. Raw SQL errors
//! never leave this module.

use std::borrow::Cow;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation failed: {reason}")]
    Validation { reason: Cow<'static, str> },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: Cow<'static, str> },

    #[error("{what} not found")]
    NotFound { what: Cow<'static, str> },

    #[error("Conflict: {reason}")]
    Conflict { reason: Cow<'static, str> },

    #[error("Precondition failed: {reason}")]
    Precondition { reason: Cow<'static, str> },

    #[error("Transport unavailable: {reason}")]
    Transport { reason: Cow<'static, str> },

    #[error("Internal error: {reason}")]
    Internal { reason: Cow<'static, str> },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn permission_denied(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<Cow<'static, str>>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn precondition(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Machine-readable code for the UI layer to translate.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationFailed",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::Precondition { .. } => "PreconditionFailed",
            Self::Transport { .. } => "TransportUnavailable",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Self::NotFound { what: "row".into() },
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => Self::Conflict {
                reason: format!(
                    "unique constraint violated: {}",
                    db.constraint().unwrap_or("unknown")
                )
                .into(),
            },
            _ => {
                tracing::error!(error = %e, "Database error");
                Self::Transport {
                    reason: "database operation failed".into(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::validation("x").code(), "ValidationFailed");
        assert_eq!(Error::permission_denied("x").code(), "PermissionDenied");
        assert_eq!(Error::not_found("ticket").code(), "NotFound");
        assert_eq!(Error::conflict("x").code(), "Conflict");
        assert_eq!(Error::precondition("x").code(), "PreconditionFailed");
        assert_eq!(Error::internal("x").code(), "Internal");
    }

    #[test]
    fn test_retryability() {
        assert!(Error::conflict("duplicate tn").is_retryable());
        assert!(Error::Transport {
            reason: "down".into()
        }
        .is_retryable());
        assert!(!Error::validation("empty subject").is_retryable());
        assert!(!Error::permission_denied("no rw on queue").is_retryable());
        assert!(!Error::precondition("pending state without until").is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "NotFound");
    }

    #[test]
    fn test_display_is_one_sentence() {
        let msg = Error::validation("subject must not be empty").to_string();
        assert!(msg.contains("subject must not be empty"));
        assert!(!msg.contains('\n'));
    }
}

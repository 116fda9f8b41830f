use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;

/// Result alias used across the crate.
pub type AuthResult<T> = Result<T, AuthError>;

/// Error taxonomy of the authentication core.
///
/// Variants carry the precise internal cause; what a caller may show to an
/// end user is decided by [`AuthError::client_message`], which collapses
/// credential and lockout failures into one generic message so responses
/// cannot be used to enumerate accounts.
#[derive(Debug, Error)]
pub enum AuthError {
    // Credential verification
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },
    #[error("Email already registered")]
    EmailExists,
    #[error("Invalid email address")]
    InvalidEmail,
    #[error("Password policy violation: {reason}")]
    WeakPassword { reason: String },

    // Token lifecycle
    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },
    #[error("Token expired")]
    TokenExpired,
    #[error("Refresh token reuse detected")]
    ReuseDetected,

    // Authorization
    #[error("Missing permission: {permission}")]
    InsufficientPermission { permission: String },
    #[error("Unknown user")]
    UnknownUser,
    #[error("Unknown role: {role}")]
    UnknownRole { role: String },
    #[error("Role {role} is protected")]
    ProtectedRole { role: String },

    // Storage
    #[error("Store unavailable: {reason}")]
    StoreUnavailable { reason: String },
    #[error("Serialization error")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    // Crypto / configuration, fatal at startup rather than per request
    #[error("Crypto failure: {reason}")]
    Crypto { reason: String },
    #[error("Configuration error")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Internal error: {error_id}")]
    Internal { error_id: Uuid },
}

impl AuthError {
    /// Creates an internal error with a correlation id, logging the context
    /// server-side so the id can be matched against logs later.
    pub fn internal(context: &str) -> Self {
        let error_id = Uuid::new_v4();
        tracing::error!(error_id = %error_id, context = %context, "Internal auth error");
        AuthError::Internal { error_id }
    }

    /// The outward-facing message for this error.
    ///
    /// Credential, lockout and unknown-user failures all map to the same
    /// string; the distinction lives only in the audit log.
    pub fn client_message(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials
            | AuthError::AccountLocked { .. }
            | AuthError::UnknownUser => "authentication failed",
            AuthError::WeakPassword { .. } => "password does not meet policy",
            AuthError::EmailExists | AuthError::InvalidEmail => "registration failed",
            AuthError::InvalidToken { .. } | AuthError::TokenExpired => "invalid or expired token",
            AuthError::ReuseDetected => "session invalidated",
            AuthError::InsufficientPermission { .. } => "permission denied",
            AuthError::UnknownRole { .. } => "unknown role",
            AuthError::ProtectedRole { .. } => "operation not permitted",
            AuthError::StoreUnavailable { .. } => "service temporarily unavailable",
            _ => "internal error",
        }
    }

    /// True for errors that indicate possible compromise rather than routine
    /// failure; callers escalate these to high-severity audit events.
    pub fn is_security_critical(&self) -> bool {
        matches!(self, AuthError::ReuseDetected)
    }

    /// True for transient storage errors worth retrying or falling back on.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::StoreUnavailable { .. })
    }
}

impl From<redis::RedisError> for AuthError {
    fn from(err: redis::RedisError) -> Self {
        AuthError::StoreUnavailable {
            reason: format!("redis: {err}"),
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AuthError::UnknownUser,
            other => AuthError::StoreUnavailable {
                reason: format!("database: {other}"),
            },
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidSignature => AuthError::InvalidToken {
                reason: "signature mismatch".to_string(),
            },
            ErrorKind::InvalidIssuer => AuthError::InvalidToken {
                reason: "issuer mismatch".to_string(),
            },
            ErrorKind::InvalidAudience => AuthError::InvalidToken {
                reason: "audience mismatch".to_string(),
            },
            ErrorKind::ImmatureSignature => AuthError::InvalidToken {
                reason: "token not yet valid".to_string(),
            },
            other => AuthError::InvalidToken {
                reason: format!("{other:?}"),
            },
        }
    }
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(err: argon2::password_hash::Error) -> Self {
        AuthError::Crypto {
            reason: format!("password hashing: {err}"),
        }
    }
}

impl From<ring::error::Unspecified> for AuthError {
    fn from(_: ring::error::Unspecified) -> Self {
        AuthError::Crypto {
            reason: "entropy source failure".to_string(),
        }
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        AuthError::internal(&format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_failures_share_one_client_message() {
        let locked = AuthError::AccountLocked { until: Utc::now() };
        assert_eq!(
            AuthError::InvalidCredentials.client_message(),
            locked.client_message()
        );
        assert_eq!(
            AuthError::UnknownUser.client_message(),
            "authentication failed"
        );
    }

    #[test]
    fn reuse_detection_is_security_critical() {
        assert!(AuthError::ReuseDetected.is_security_critical());
        assert!(!AuthError::TokenExpired.is_security_critical());
    }

    #[test]
    fn jwt_errors_map_by_kind() {
        let err = jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::ExpiredSignature,
        );
        assert!(matches!(AuthError::from(err), AuthError::TokenExpired));

        let err =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidSignature);
        assert!(matches!(
            AuthError::from(err),
            AuthError::InvalidToken { .. }
        ));
    }

    #[test]
    fn internal_errors_carry_a_correlation_id() {
        let a = AuthError::internal("context a");
        let b = AuthError::internal("context b");
        let (AuthError::Internal { error_id: ida }, AuthError::Internal { error_id: idb }) =
            (a, b)
        else {
            panic!("expected internal errors");
        };
        assert_ne!(ida, idb);
    }
}

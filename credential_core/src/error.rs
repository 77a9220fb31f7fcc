//! Credential error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by every credential manager
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Malformed identifier or input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No matching row
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Artifact is past its expiry
    #[error("Credential expired")]
    Expired,

    /// Single-use artifact was already redeemed
    #[error("Credential already used")]
    AlreadyUsed,

    /// Artifact was revoked (includes deny-listed JWTs and replayed refresh tokens)
    #[error("Credential revoked")]
    Revoked,

    /// Access code reached its usage cap
    #[error("Credential usage limit exhausted")]
    Exhausted,

    /// WebAuthn sign counter did not advance
    #[error("Authenticator sign count regression, credential may be cloned")]
    CloneDetected,

    /// Lost a race or hit a uniqueness rule
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Access code is not valid for the requested scope
    #[error("Access code scope mismatch")]
    ScopeMismatch,

    /// Timeout, pool exhaustion or connection failure; safe to retry
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Non-retryable database error
    #[error("Database error: {0}")]
    Store(sqlx::Error),

    /// JWT encode/decode failure
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Session payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for CredentialError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => CredentialError::TransientStore(err.to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                CredentialError::Conflict(db.message().to_string())
            }
            other => CredentialError::Store(other),
        }
    }
}

impl CredentialError {
    /// Whether the caller may retry the operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, CredentialError::TransientStore(_))
    }

    /// Get a client-safe error message that doesn't leak sensitive information
    ///
    /// Store and JWT errors are sanitized so that SQL details and token
    /// structure never reach a client.
    pub fn client_message(&self) -> String {
        match self {
            CredentialError::Store(_) | CredentialError::TransientStore(_) => {
                "Internal server error".to_string()
            }
            CredentialError::Jwt(_) => "Authentication failed".to_string(),
            CredentialError::Serialization(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Result type for credential operations
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Parse a textual identifier, mapping failures to `CredentialError::Validation`
///
/// `what` names the identifier in the error message (e.g. "user ID").
pub fn parse_id(what: &str, raw: &str) -> CredentialResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| CredentialError::Validation(format!("invalid {what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_rejects_garbage() {
        let err = parse_id("user ID", "not-a-uuid").unwrap_err();
        assert!(matches!(err, CredentialError::Validation(_)));
        assert!(err.to_string().contains("user ID"));
    }

    #[test]
    fn test_parse_id_trims_whitespace() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id("code ID", &format!(" {id} ")).unwrap(), id);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = CredentialError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert_eq!(err.client_message(), "Internal server error");
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        let err = CredentialError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
        assert!(matches!(err, CredentialError::Store(_)));
    }

    #[test]
    fn test_domain_errors_are_client_safe() {
        assert_eq!(
            CredentialError::AlreadyUsed.client_message(),
            "Credential already used"
        );
        assert_eq!(
            CredentialError::NotFound("Access code").client_message(),
            "Access code not found"
        );
    }
}

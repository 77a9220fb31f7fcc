//! Email token data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two single-use email flows. Both share one row shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTokenKind {
    Verification,
    PasswordReset,
}

impl EmailTokenKind {
    /// Backing table for this kind
    pub fn table(self) -> &'static str {
        match self {
            EmailTokenKind::Verification => "email_verification_tokens",
            EmailTokenKind::PasswordReset => "password_reset_tokens",
        }
    }
}

impl std::fmt::Display for EmailTokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailTokenKind::Verification => write!(f, "verification"),
            EmailTokenKind::PasswordReset => write!(f, "password_reset"),
        }
    }
}

/// Stored email token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailToken {
    pub user_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EmailToken {
    pub fn new(user_id: Uuid, token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            token,
            expires_at,
            used_at: None,
            created_at: Utc::now(),
        }
    }
}

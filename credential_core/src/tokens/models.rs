//! Token data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Deny-list entry for a JWT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRevocation {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub revoked_at: DateTime<Utc>,
}

/// Stored refresh token. Only the hash of the token is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    /// Every token rotated from the same login shares a family
    pub family_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Set when the token was exchanged for a successor
    pub rotated_at: Option<DateTime<Utc>>,
    pub user_agent: String,
    pub ip_address: Option<IpAddr>,
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    /// New token starting a fresh family
    pub fn new(
        user_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
        meta: ClientMeta,
    ) -> Self {
        Self::in_family(Uuid::new_v4(), user_id, token_hash, expires_at, meta)
    }

    /// New token continuing `family_id`
    pub fn in_family(
        family_id: Uuid,
        user_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
        meta: ClientMeta,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            token_hash,
            family_id,
            expires_at,
            revoked_at: None,
            rotated_at: None,
            user_agent: meta.user_agent,
            ip_address: meta.ip,
            created_at: Utc::now(),
        }
    }

    /// Valid iff not revoked and not expired at `now`
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Client metadata recorded with a refresh token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub user_agent: String,
    pub ip: Option<IpAddr>,
}

impl ClientMeta {
    pub fn new(user_agent: impl Into<String>, ip: Option<IpAddr>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ip,
        }
    }
}

/// JWT claims for access tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: Uuid,  // User ID
    pub jti: Uuid,  // Token ID, the deny-list key
    pub role: String,
    pub exp: i64,   // Expiration timestamp
    pub iat: i64,   // Issued at timestamp
}

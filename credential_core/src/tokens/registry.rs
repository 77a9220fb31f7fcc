//! JWT deny-list and refresh token registry.
//!
//! Refresh tokens rotate on every use. Each successful rotation retires the
//! presented token (`rotated_at` + `revoked_at`) and stores its successor in
//! the same family. A retired token that shows up again means the token
//! leaked, so the whole family is revoked.

use super::jwt::JwtCodec;
use super::models::{AccessTokenClaims, ClientMeta, RefreshToken};
use crate::config::CoreConfig;
use crate::db::timeouts::with_timeout;
use crate::error::{CredentialError, CredentialResult};
use crate::store::{Conditional, CredentialStore, Rejection};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

const ENTITY: &str = "Refresh token";

/// Registry for JWT revocations and refresh tokens
#[derive(Clone)]
pub struct AuthTokenRegistry {
    store: Arc<dyn CredentialStore>,
    refresh_ttl: Duration,
    timeout: StdDuration,
}

impl AuthTokenRegistry {
    pub fn new(store: Arc<dyn CredentialStore>, config: &CoreConfig) -> Self {
        Self {
            store,
            refresh_ttl: config.refresh_token_ttl,
            timeout: config.store_timeout,
        }
    }

    /// Override the per-call store timeout
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Expiry for a refresh token issued now
    pub fn refresh_expiry(&self) -> DateTime<Utc> {
        Utc::now() + self.refresh_ttl
    }

    /// Deny-list a JWT by its `jti`; repeated calls are no-ops
    pub async fn revoke_token(&self, token_id: Uuid, user_id: Uuid) -> CredentialResult<()> {
        with_timeout(
            self.timeout,
            self.store.insert_token_revocation(token_id, user_id),
        )
        .await?;
        tracing::info!(token_id = %token_id, user_id = %user_id, "Revoked access token");
        Ok(())
    }

    pub async fn is_token_revoked(&self, token_id: Uuid) -> CredentialResult<bool> {
        with_timeout(self.timeout, self.store.is_token_revoked(token_id)).await
    }

    /// Verify a JWT's signature and expiry, then consult the deny-list
    ///
    /// # Errors
    ///
    /// * `CredentialError::Jwt` - Bad signature, malformed or expired token
    /// * `CredentialError::Revoked` - The token's `jti` is deny-listed
    pub async fn verify_access_token(
        &self,
        codec: &JwtCodec,
        token: &str,
    ) -> CredentialResult<AccessTokenClaims> {
        let claims = codec.decode(token)?;
        if self.is_token_revoked(claims.jti).await? {
            return Err(CredentialError::Revoked);
        }
        Ok(claims)
    }

    /// Store a refresh token that starts a new family
    ///
    /// # Arguments
    ///
    /// * `user_id` - Owner of the token
    /// * `token_hash` - SHA-256 of the plaintext token (see [`super::hash_refresh_token`])
    /// * `expires_at` - Absolute expiry
    /// * `meta` - Client user agent and IP
    pub async fn store_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        meta: ClientMeta,
    ) -> CredentialResult<RefreshToken> {
        let token = RefreshToken::new(user_id, token_hash.to_string(), expires_at, meta);
        with_timeout(self.timeout, self.store.insert_refresh_token(&token)).await?;
        tracing::debug!(user_id = %user_id, family_id = %token.family_id, "Stored refresh token");
        Ok(token)
    }

    /// Revoke one refresh token; false if unknown or already revoked
    pub async fn revoke_refresh_token(&self, token_hash: &str) -> CredentialResult<bool> {
        with_timeout(self.timeout, self.store.revoke_refresh_token(token_hash)).await
    }

    /// Revoke every live refresh token of a user (logout everywhere)
    pub async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> CredentialResult<u64> {
        let revoked = with_timeout(
            self.timeout,
            self.store.revoke_refresh_tokens_for_user(user_id),
        )
        .await?;
        tracing::info!(user_id = %user_id, revoked, "Revoked all refresh tokens");
        Ok(revoked)
    }

    /// Owner of a refresh token that is neither revoked nor expired
    pub async fn get_refresh_token_user(&self, token_hash: &str) -> CredentialResult<Uuid> {
        let token = with_timeout(self.timeout, self.store.refresh_token_by_hash(token_hash))
            .await?
            .ok_or(CredentialError::NotFound(ENTITY))?;

        if token.is_valid(Utc::now()) {
            Ok(token.user_id)
        } else if token.revoked_at.is_some() {
            Err(CredentialError::Revoked)
        } else {
            Err(CredentialError::Expired)
        }
    }

    /// Exchange a refresh token for its successor
    ///
    /// Returns the successor record, which carries the presented token's
    /// owner and family.
    ///
    /// # Errors
    ///
    /// * `CredentialError::Revoked` - Token was revoked, or was already rotated (replay:
    ///   the whole family is revoked before returning)
    /// * `CredentialError::Expired` - Token is past its expiry
    /// * `CredentialError::NotFound` - Unknown token
    pub async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        meta: ClientMeta,
    ) -> CredentialResult<RefreshToken> {
        // Owner and family are filled in by the store from the presented token
        let mut successor =
            RefreshToken::new(Uuid::nil(), new_hash.to_string(), expires_at, meta);

        let outcome = with_timeout(
            self.timeout,
            self.store.rotate_refresh_token(presented_hash, &successor),
        )
        .await?;

        match outcome {
            Conditional::Applied(retired) => {
                successor.user_id = retired.user_id;
                successor.family_id = retired.family_id;
                tracing::debug!(
                    user_id = %retired.user_id,
                    family_id = %retired.family_id,
                    "Rotated refresh token"
                );
                Ok(successor)
            }
            Conditional::Rejected(Rejection::Replayed { family_id, user_id }) => {
                let revoked = with_timeout(
                    self.timeout,
                    self.store.revoke_refresh_family(family_id),
                )
                .await?;
                tracing::warn!(
                    user_id = %user_id,
                    family_id = %family_id,
                    revoked,
                    "Refresh token replay detected, family revoked"
                );
                Err(CredentialError::Revoked)
            }
            Conditional::Rejected(rejection) => Err(rejection.into_error(ENTITY)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCredentialStore;

    fn registry() -> AuthTokenRegistry {
        AuthTokenRegistry::new(
            Arc::new(MemoryCredentialStore::new()),
            &CoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_revocation_is_idempotent() {
        let registry = registry();
        let (token_id, user_id) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(!registry.is_token_revoked(token_id).await.unwrap());
        registry.revoke_token(token_id, user_id).await.unwrap();
        registry.revoke_token(token_id, user_id).await.unwrap();
        assert!(registry.is_token_revoked(token_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_access_token_consults_deny_list() {
        let registry = registry();
        let codec = JwtCodec::new(b"registry_secret_registry_secret_x", Duration::minutes(5));
        let (token, claims) = codec.issue(Uuid::new_v4(), "civilian").unwrap();

        assert_eq!(
            registry.verify_access_token(&codec, &token).await.unwrap(),
            claims
        );

        registry.revoke_token(claims.jti, claims.sub).await.unwrap();
        assert!(matches!(
            registry.verify_access_token(&codec, &token).await,
            Err(CredentialError::Revoked)
        ));
    }

    #[tokio::test]
    async fn test_expired_refresh_token_is_rejected() {
        let registry = registry();
        registry
            .store_refresh_token(
                Uuid::new_v4(),
                "expired-hash",
                Utc::now() - Duration::seconds(1),
                ClientMeta::default(),
            )
            .await
            .unwrap();

        assert!(matches!(
            registry.get_refresh_token_user("expired-hash").await,
            Err(CredentialError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_rotation_keeps_family() {
        let registry = registry();
        let user_id = Uuid::new_v4();
        let first = registry
            .store_refresh_token(user_id, "h1", registry.refresh_expiry(), ClientMeta::default())
            .await
            .unwrap();

        let second = registry
            .rotate_refresh_token("h1", "h2", registry.refresh_expiry(), ClientMeta::default())
            .await
            .unwrap();
        assert_eq!(second.family_id, first.family_id);
        assert_eq!(second.user_id, user_id);

        assert_eq!(registry.get_refresh_token_user("h2").await.unwrap(), user_id);
        assert!(matches!(
            registry.get_refresh_token_user("h1").await,
            Err(CredentialError::Revoked)
        ));
    }

    #[tokio::test]
    async fn test_replay_revokes_family() {
        let registry = registry();
        let user_id = Uuid::new_v4();
        registry
            .store_refresh_token(user_id, "a", registry.refresh_expiry(), ClientMeta::default())
            .await
            .unwrap();
        registry
            .rotate_refresh_token("a", "b", registry.refresh_expiry(), ClientMeta::default())
            .await
            .unwrap();

        let replay = registry
            .rotate_refresh_token("a", "c", registry.refresh_expiry(), ClientMeta::default())
            .await;
        assert!(matches!(replay, Err(CredentialError::Revoked)));

        assert!(matches!(
            registry.get_refresh_token_user("b").await,
            Err(CredentialError::Revoked)
        ));
        assert!(matches!(
            registry.get_refresh_token_user("c").await,
            Err(CredentialError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_logout_everywhere() {
        let registry = registry();
        let user_id = Uuid::new_v4();
        for hash in ["x1", "x2"] {
            registry
                .store_refresh_token(user_id, hash, registry.refresh_expiry(), ClientMeta::default())
                .await
                .unwrap();
        }

        assert_eq!(registry.revoke_all_refresh_tokens(user_id).await.unwrap(), 2);
        assert!(!registry.revoke_refresh_token("x1").await.unwrap());
    }
}

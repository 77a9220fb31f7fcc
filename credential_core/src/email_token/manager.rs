//! Single-use email token manager.

use super::models::{EmailToken, EmailTokenKind};
use crate::config::CoreConfig;
use crate::db::timeouts::with_timeout;
use crate::error::CredentialResult;
use crate::store::CredentialStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

const ENTITY: &str = "Email token";

/// Issues and redeems verification and password-reset tokens
#[derive(Clone)]
pub struct EmailTokenManager {
    store: Arc<dyn CredentialStore>,
    verification_ttl: Duration,
    password_reset_ttl: Duration,
    timeout: StdDuration,
}

impl EmailTokenManager {
    pub fn new(store: Arc<dyn CredentialStore>, config: &CoreConfig) -> Self {
        Self {
            store,
            verification_ttl: config.email_verification_ttl,
            password_reset_ttl: config.password_reset_ttl,
            timeout: config.store_timeout,
        }
    }

    /// Override the per-call store timeout
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default lifetime of a token of `kind`
    pub fn ttl(&self, kind: EmailTokenKind) -> Duration {
        match kind {
            EmailTokenKind::Verification => self.verification_ttl,
            EmailTokenKind::PasswordReset => self.password_reset_ttl,
        }
    }

    pub async fn store_verification_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> CredentialResult<()> {
        self.store_token(EmailTokenKind::Verification, user_id, token, expires_at)
            .await
    }

    pub async fn store_password_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> CredentialResult<()> {
        self.store_token(EmailTokenKind::PasswordReset, user_id, token, expires_at)
            .await
    }

    /// Redeem a verification token, returning its owner
    pub async fn verify_verification_token(&self, token: &str) -> CredentialResult<Uuid> {
        self.claim(EmailTokenKind::Verification, token).await
    }

    /// Redeem a password reset token, returning its owner
    pub async fn verify_password_reset_token(&self, token: &str) -> CredentialResult<Uuid> {
        self.claim(EmailTokenKind::PasswordReset, token).await
    }

    /// Mint and store a UUIDv4 token of `kind` with that kind's default lifetime
    pub async fn issue(&self, kind: EmailTokenKind, user_id: Uuid) -> CredentialResult<String> {
        let token = Uuid::new_v4().to_string();
        self.store_token(kind, user_id, &token, Utc::now() + self.ttl(kind))
            .await?;
        Ok(token)
    }

    /// Redeem a token of `kind`
    ///
    /// Exactly one of any number of concurrent calls for the same token
    /// succeeds; the others fail with `AlreadyUsed`.
    pub async fn consume(&self, kind: EmailTokenKind, token: &str) -> CredentialResult<Uuid> {
        match kind {
            EmailTokenKind::Verification => self.verify_verification_token(token).await,
            EmailTokenKind::PasswordReset => self.verify_password_reset_token(token).await,
        }
    }

    async fn store_token(
        &self,
        kind: EmailTokenKind,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> CredentialResult<()> {
        let record = EmailToken::new(user_id, token.to_string(), expires_at);
        with_timeout(self.timeout, self.store.insert_email_token(kind, &record)).await?;
        tracing::info!(kind = %kind, user_id = %user_id, expires_at = %expires_at, "Stored email token");
        Ok(())
    }

    async fn claim(&self, kind: EmailTokenKind, token: &str) -> CredentialResult<Uuid> {
        let result = with_timeout(self.timeout, self.store.claim_email_token(kind, token))
            .await?
            .into_result(ENTITY);

        match &result {
            Ok(user_id) => tracing::info!(kind = %kind, user_id = %user_id, "Email token redeemed"),
            Err(e) => tracing::debug!(kind = %kind, error = %e, "Email token rejected"),
        }
        result
    }
}

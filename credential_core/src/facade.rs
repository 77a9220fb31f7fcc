//! Operation surface composed from the four managers.
//!
//! Identifiers arrive here as text from request handlers and the CLI, and a
//! malformed one fails with `CredentialError::Validation` before the store is
//! touched.

use crate::access_code::{
    AccessCode, AccessCodeManager, AccessCodeRequest, AccessCodeTarget, BulkRotation,
    IssuedAccessCode, hash_access_code,
};
use crate::config::CoreConfig;
use crate::email_token::{EmailTokenKind, EmailTokenManager};
use crate::error::{CredentialResult, parse_id};
use crate::store::CredentialStore;
use crate::tokens::{AuthTokenRegistry, ClientMeta, RefreshToken};
use crate::webauthn::{
    CeremonyChallenge, CeremonyKind, CeremonyResponse, WebAuthnCredential, WebAuthnManager,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Credential lifecycle facade
#[derive(Clone)]
pub struct CredentialCore {
    access_codes: AccessCodeManager,
    tokens: AuthTokenRegistry,
    email_tokens: EmailTokenManager,
    webauthn: WebAuthnManager,
}

impl CredentialCore {
    /// Build every manager over one shared store
    pub fn new(store: Arc<dyn CredentialStore>, config: &CoreConfig) -> Self {
        Self {
            access_codes: AccessCodeManager::new(store.clone(), config),
            tokens: AuthTokenRegistry::new(store.clone(), config),
            email_tokens: EmailTokenManager::new(store.clone(), config),
            webauthn: WebAuthnManager::new(store, config),
        }
    }

    pub fn access_codes(&self) -> &AccessCodeManager {
        &self.access_codes
    }

    pub fn tokens(&self) -> &AuthTokenRegistry {
        &self.tokens
    }

    pub fn email_tokens(&self) -> &EmailTokenManager {
        &self.email_tokens
    }

    pub fn webauthn(&self) -> &WebAuthnManager {
        &self.webauthn
    }

    // ---- access codes ----

    /// Issue a code; the plaintext is only ever returned from this call
    pub async fn create_access_code(
        &self,
        request: AccessCodeRequest,
    ) -> CredentialResult<IssuedAccessCode> {
        self.access_codes.create(request).await
    }

    pub async fn get_active_access_code(&self, user_id: &str) -> CredentialResult<AccessCode> {
        let user_id = parse_id("user ID", user_id)?;
        self.access_codes.get_active_for_user(user_id).await
    }

    /// Validate a code by hash and count the use
    pub async fn verify_access_code(&self, code_hash: &str) -> CredentialResult<AccessCode> {
        self.access_codes.verify(code_hash, None, "").await
    }

    /// Validate a plaintext code for a specific user and scope, counting the use
    pub async fn verify_access_code_for(
        &self,
        code: &str,
        user_id: &str,
        scope: &str,
    ) -> CredentialResult<AccessCode> {
        let user_id = parse_id("user ID", user_id)?;
        self.access_codes
            .verify(&hash_access_code(code), Some(user_id), scope)
            .await
    }

    /// Revoke one code or every code of a user, returning how many were revoked
    pub async fn revoke_access_code(&self, target: AccessCodeTarget) -> CredentialResult<u64> {
        match target {
            AccessCodeTarget::Code(id) => self.access_codes.revoke(id).await.map(|()| 1),
            AccessCodeTarget::User(user_id) => self.access_codes.revoke_by_user(user_id).await,
        }
    }

    pub async fn list_codes_due_for_rotation(&self) -> CredentialResult<Vec<AccessCode>> {
        self.access_codes.list_rotation_due().await
    }

    pub async fn apply_rotation(&self, code_id: &str, next: DateTime<Utc>) -> CredentialResult<()> {
        let code_id = parse_id("access code ID", code_id)?;
        self.access_codes.update_rotation(code_id, next).await
    }

    /// Replace a user's code with a fresh one carrying the same attributes
    pub async fn rotate_access_code_for_user(
        &self,
        user_id: &str,
        created_by: Option<&str>,
    ) -> CredentialResult<IssuedAccessCode> {
        let user_id = parse_id("user ID", user_id)?;
        let created_by = created_by
            .map(|raw| parse_id("issuer ID", raw))
            .transpose()?;
        self.access_codes.rotate_for_user(user_id, created_by).await
    }

    /// Rotate every subject holding an active code
    pub async fn rotate_all_access_codes(
        &self,
        created_by: Option<&str>,
    ) -> CredentialResult<BulkRotation> {
        let created_by = created_by
            .map(|raw| parse_id("issuer ID", raw))
            .transpose()?;
        self.access_codes.rotate_all_active(created_by).await
    }

    /// Newest codes first, at most `limit` (clamped to `1..=200`)
    pub async fn list_access_codes(&self, limit: i64) -> CredentialResult<Vec<AccessCode>> {
        self.access_codes.list(limit).await
    }

    // ---- JWT deny-list ----

    pub async fn revoke_jwt(&self, token_id: &str, user_id: &str) -> CredentialResult<()> {
        let token_id = parse_id("token ID", token_id)?;
        let user_id = parse_id("user ID", user_id)?;
        self.tokens.revoke_token(token_id, user_id).await
    }

    pub async fn is_jwt_revoked(&self, token_id: &str) -> CredentialResult<bool> {
        let token_id = parse_id("token ID", token_id)?;
        self.tokens.is_token_revoked(token_id).await
    }

    // ---- refresh tokens ----

    /// Store a refresh token (by hash) starting a new family, with the configured lifetime
    pub async fn issue_refresh_token(
        &self,
        user_id: &str,
        token_hash: &str,
        meta: ClientMeta,
    ) -> CredentialResult<RefreshToken> {
        let user_id = parse_id("user ID", user_id)?;
        self.tokens
            .store_refresh_token(user_id, token_hash, self.tokens.refresh_expiry(), meta)
            .await
    }

    pub async fn revoke_refresh_token(&self, token_hash: &str) -> CredentialResult<bool> {
        self.tokens.revoke_refresh_token(token_hash).await
    }

    /// Owner of a live refresh token
    pub async fn resolve_refresh_token(&self, token_hash: &str) -> CredentialResult<Uuid> {
        self.tokens.get_refresh_token_user(token_hash).await
    }

    pub async fn rotate_refresh_token(
        &self,
        token_hash: &str,
        new_hash: &str,
        meta: ClientMeta,
    ) -> CredentialResult<RefreshToken> {
        self.tokens
            .rotate_refresh_token(token_hash, new_hash, self.tokens.refresh_expiry(), meta)
            .await
    }

    // ---- email tokens ----

    pub async fn issue_email_token(
        &self,
        kind: EmailTokenKind,
        user_id: &str,
    ) -> CredentialResult<String> {
        let user_id = parse_id("user ID", user_id)?;
        self.email_tokens.issue(kind, user_id).await
    }

    pub async fn consume_email_token(
        &self,
        kind: EmailTokenKind,
        token: &str,
    ) -> CredentialResult<Uuid> {
        self.email_tokens.consume(kind, token).await
    }

    // ---- WebAuthn ----

    pub async fn begin_webauthn_ceremony<T: Serialize>(
        &self,
        user_id: &str,
        kind: CeremonyKind,
        session_data: &T,
    ) -> CredentialResult<CeremonyChallenge> {
        let user_id = parse_id("user ID", user_id)?;
        self.webauthn
            .begin_ceremony(user_id, kind, session_data)
            .await
    }

    pub async fn complete_webauthn_ceremony(
        &self,
        user_id: &str,
        kind: CeremonyKind,
        response: CeremonyResponse,
    ) -> CredentialResult<WebAuthnCredential> {
        let user_id = parse_id("user ID", user_id)?;
        self.webauthn.complete_ceremony(user_id, kind, response).await
    }

    pub async fn list_credentials(&self, user_id: &str) -> CredentialResult<Vec<WebAuthnCredential>> {
        let user_id = parse_id("user ID", user_id)?;
        self.webauthn.get_credentials_by_user_id(user_id).await
    }
}

//! In-process credential store.
//!
//! Every operation runs under a single mutex, which makes each call
//! linearizable exactly like the conditional statements of
//! [`PgCredentialStore`](super::PgCredentialStore). State lives only as long
//! as the store value, so this is meant for tests and single-process
//! embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Conditional, CredentialStore, Rejection};
use crate::access_code::{AccessCode, CreateMode};
use crate::email_token::{EmailToken, EmailTokenKind};
use crate::error::{CredentialError, CredentialResult};
use crate::tokens::{RefreshToken, TokenRevocation};
use crate::webauthn::{CeremonyKind, WebAuthnCredential, WebAuthnSession};

#[derive(Default)]
struct State {
    access_codes: Vec<AccessCode>,
    revocations: HashMap<Uuid, TokenRevocation>,
    refresh_tokens: HashMap<String, RefreshToken>,
    email_tokens: HashMap<(EmailTokenKind, String), EmailToken>,
    sessions: Vec<WebAuthnSession>,
    credentials: Vec<WebAuthnCredential>,
}

/// Mutex-guarded in-memory implementation of [`CredentialStore`]
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<State>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn revoke_live_codes(codes: &mut [AccessCode], user_id: Uuid, now: DateTime<Utc>) -> u64 {
    let mut changed = 0;
    for code in codes
        .iter_mut()
        .filter(|c| c.user_id == Some(user_id) && c.revoked_at.is_none())
    {
        code.revoked_at = Some(now);
        changed += 1;
    }
    changed
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn insert_access_code(
        &self,
        code: &AccessCode,
        mode: CreateMode,
    ) -> CredentialResult<Conditional<()>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if state
            .access_codes
            .iter()
            .any(|c| c.id == code.id || c.code_hash == code.code_hash)
        {
            return Err(CredentialError::Conflict(
                "access code id or hash already exists".to_string(),
            ));
        }

        if let Some(user_id) = code.user_id {
            let has_active = state
                .access_codes
                .iter()
                .any(|c| c.user_id == Some(user_id) && c.is_active(now));
            match mode {
                CreateMode::RejectIfActive if has_active => {
                    return Ok(Conditional::Rejected(Rejection::ActiveExists));
                }
                CreateMode::ReplaceActive => {
                    revoke_live_codes(&mut state.access_codes, user_id, now);
                }
                CreateMode::RejectIfActive => {}
            }
        }

        state.access_codes.push(code.clone());
        Ok(Conditional::Applied(()))
    }

    async fn active_access_code_for_user(
        &self,
        user_id: Uuid,
    ) -> CredentialResult<Option<AccessCode>> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(state
            .access_codes
            .iter()
            .filter(|c| c.user_id == Some(user_id) && c.is_active(now))
            .max_by_key(|c| c.issued_at)
            .cloned())
    }

    async fn access_code_by_hash(&self, code_hash: &str) -> CredentialResult<Option<AccessCode>> {
        let state = self.state.lock().await;
        Ok(state
            .access_codes
            .iter()
            .find(|c| c.code_hash == code_hash)
            .cloned())
    }

    async fn increment_access_code_usage(
        &self,
        id: Uuid,
    ) -> CredentialResult<Conditional<AccessCode>> {
        let mut state = self.state.lock().await;
        let Some(code) = state.access_codes.iter_mut().find(|c| c.id == id) else {
            return Ok(Conditional::Rejected(Rejection::Missing));
        };
        if code.is_exhausted() {
            return Ok(Conditional::Rejected(Rejection::Exhausted));
        }
        code.usage_count += 1;
        code.last_used_at = Some(Utc::now());
        Ok(Conditional::Applied(code.clone()))
    }

    async fn claim_access_code_use(&self, id: Uuid) -> CredentialResult<Conditional<AccessCode>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(code) = state.access_codes.iter_mut().find(|c| c.id == id) else {
            return Ok(Conditional::Rejected(Rejection::Missing));
        };
        if code.revoked_at.is_some() {
            return Ok(Conditional::Rejected(Rejection::Revoked));
        }
        if code.expires_at <= now {
            return Ok(Conditional::Rejected(Rejection::Expired));
        }
        if code.is_exhausted() {
            return Ok(Conditional::Rejected(Rejection::Exhausted));
        }
        code.usage_count += 1;
        code.last_used_at = Some(now);
        Ok(Conditional::Applied(code.clone()))
    }

    async fn revoke_access_code(&self, id: Uuid) -> CredentialResult<bool> {
        let mut state = self.state.lock().await;
        match state.access_codes.iter_mut().find(|c| c.id == id) {
            Some(code) => {
                code.revoked_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_access_codes_for_user(&self, user_id: Uuid) -> CredentialResult<u64> {
        let mut state = self.state.lock().await;
        Ok(revoke_live_codes(&mut state.access_codes, user_id, Utc::now()))
    }

    async fn access_codes_due_for_rotation(&self) -> CredentialResult<Vec<AccessCode>> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(state
            .access_codes
            .iter()
            .filter(|c| c.is_rotation_due(now))
            .cloned()
            .collect())
    }

    async fn claim_due_rotation(&self, id: Uuid, until: DateTime<Utc>) -> CredentialResult<bool> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        match state
            .access_codes
            .iter_mut()
            .find(|c| c.id == id && c.is_rotation_due(now))
        {
            Some(code) => {
                code.next_rotation_at = until;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_access_code_user_ids(&self) -> CredentialResult<Vec<Uuid>> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut user_ids: Vec<Uuid> = state
            .access_codes
            .iter()
            .filter(|c| c.is_active(now))
            .filter_map(|c| c.user_id)
            .collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        Ok(user_ids)
    }

    async fn set_next_rotation(&self, id: Uuid, next: DateTime<Utc>) -> CredentialResult<bool> {
        let mut state = self.state.lock().await;
        match state.access_codes.iter_mut().find(|c| c.id == id) {
            Some(code) => {
                code.next_rotation_at = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_access_codes(&self, limit: i64) -> CredentialResult<Vec<AccessCode>> {
        let state = self.state.lock().await;
        let mut codes = state.access_codes.clone();
        codes.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        codes.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(codes)
    }

    async fn insert_token_revocation(
        &self,
        token_id: Uuid,
        user_id: Uuid,
    ) -> CredentialResult<()> {
        let mut state = self.state.lock().await;
        state
            .revocations
            .entry(token_id)
            .or_insert_with(|| TokenRevocation {
                token_id,
                user_id,
                revoked_at: Utc::now(),
            });
        Ok(())
    }

    async fn is_token_revoked(&self, token_id: Uuid) -> CredentialResult<bool> {
        let state = self.state.lock().await;
        Ok(state.revocations.contains_key(&token_id))
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> CredentialResult<()> {
        let mut state = self.state.lock().await;
        if state.refresh_tokens.contains_key(&token.token_hash) {
            return Err(CredentialError::Conflict(
                "refresh token hash already exists".to_string(),
            ));
        }
        state
            .refresh_tokens
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> CredentialResult<Option<RefreshToken>> {
        let state = self.state.lock().await;
        Ok(state.refresh_tokens.get(token_hash).cloned())
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> CredentialResult<bool> {
        let mut state = self.state.lock().await;
        match state.refresh_tokens.get_mut(token_hash) {
            Some(token) if token.revoked_at.is_none() => {
                token.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor: &RefreshToken,
    ) -> CredentialResult<Conditional<RefreshToken>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if state.refresh_tokens.contains_key(&successor.token_hash) {
            return Err(CredentialError::Conflict(
                "refresh token hash already exists".to_string(),
            ));
        }

        let Some(presented) = state.refresh_tokens.get_mut(presented_hash) else {
            return Ok(Conditional::Rejected(Rejection::Missing));
        };
        if presented.rotated_at.is_some() {
            return Ok(Conditional::Rejected(Rejection::Replayed {
                family_id: presented.family_id,
                user_id: presented.user_id,
            }));
        }
        if presented.revoked_at.is_some() {
            return Ok(Conditional::Rejected(Rejection::Revoked));
        }
        if presented.expires_at <= now {
            return Ok(Conditional::Rejected(Rejection::Expired));
        }

        presented.revoked_at = Some(now);
        presented.rotated_at = Some(now);
        let retired = presented.clone();

        let mut next = successor.clone();
        next.family_id = retired.family_id;
        next.user_id = retired.user_id;
        state.refresh_tokens.insert(next.token_hash.clone(), next);

        Ok(Conditional::Applied(retired))
    }

    async fn revoke_refresh_family(&self, family_id: Uuid) -> CredentialResult<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for token in state
            .refresh_tokens
            .values_mut()
            .filter(|t| t.family_id == family_id && t.revoked_at.is_none())
        {
            token.revoked_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn revoke_refresh_tokens_for_user(&self, user_id: Uuid) -> CredentialResult<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for token in state
            .refresh_tokens
            .values_mut()
            .filter(|t| t.user_id == user_id && t.revoked_at.is_none())
        {
            token.revoked_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn insert_email_token(
        &self,
        kind: EmailTokenKind,
        token: &EmailToken,
    ) -> CredentialResult<()> {
        let mut state = self.state.lock().await;
        let key = (kind, token.token.clone());
        if state.email_tokens.contains_key(&key) {
            return Err(CredentialError::Conflict(format!(
                "{kind} token already exists"
            )));
        }
        state.email_tokens.insert(key, token.clone());
        Ok(())
    }

    async fn claim_email_token(
        &self,
        kind: EmailTokenKind,
        token: &str,
    ) -> CredentialResult<Conditional<Uuid>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(row) = state.email_tokens.get_mut(&(kind, token.to_string())) else {
            return Ok(Conditional::Rejected(Rejection::Missing));
        };
        if row.used_at.is_some() {
            return Ok(Conditional::Rejected(Rejection::AlreadyUsed));
        }
        if row.expires_at <= now {
            return Ok(Conditional::Rejected(Rejection::Expired));
        }
        row.used_at = Some(now);
        Ok(Conditional::Applied(row.user_id))
    }

    async fn insert_webauthn_session(&self, session: &WebAuthnSession) -> CredentialResult<()> {
        let mut state = self.state.lock().await;
        if state.sessions.iter().any(|s| s.id == session.id) {
            return Err(CredentialError::Conflict(
                "webauthn session id already exists".to_string(),
            ));
        }
        state.sessions.push(session.clone());
        Ok(())
    }

    async fn latest_webauthn_session(
        &self,
        user_id: Uuid,
        kind: CeremonyKind,
    ) -> CredentialResult<Option<WebAuthnSession>> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .filter(|s| {
                s.user_id == user_id
                    && s.session_type == kind
                    && s.consumed_at.is_none()
                    && s.expires_at > now
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn consume_webauthn_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        kind: CeremonyKind,
    ) -> CredentialResult<Conditional<WebAuthnSession>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(session) = state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.user_id == user_id && s.session_type == kind)
        else {
            return Ok(Conditional::Rejected(Rejection::Missing));
        };
        if session.consumed_at.is_some() {
            return Ok(Conditional::Rejected(Rejection::AlreadyUsed));
        }
        if session.expires_at <= now {
            return Ok(Conditional::Rejected(Rejection::Expired));
        }
        session.consumed_at = Some(now);
        Ok(Conditional::Applied(session.clone()))
    }

    async fn upsert_webauthn_credential(
        &self,
        credential: &WebAuthnCredential,
    ) -> CredentialResult<Conditional<WebAuthnCredential>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let position = state
            .credentials
            .iter()
            .position(|c| c.credential_id == credential.credential_id);

        match position {
            Some(idx) if state.credentials[idx].user_id != credential.user_id => {
                Ok(Conditional::Rejected(Rejection::OwnedByOther))
            }
            Some(idx) => {
                let stored = &mut state.credentials[idx];
                stored.public_key = credential.public_key.clone();
                stored.attestation_type = credential.attestation_type.clone();
                stored.transports = credential.transports.clone();
                stored.aaguid = credential.aaguid.clone();
                stored.sign_count = stored.sign_count.max(credential.sign_count);
                stored.last_used_at = now;
                Ok(Conditional::Applied(stored.clone()))
            }
            None => {
                let mut inserted = credential.clone();
                inserted.last_used_at = now;
                state.credentials.push(inserted.clone());
                Ok(Conditional::Applied(inserted))
            }
        }
    }

    async fn webauthn_credentials_for_user(
        &self,
        user_id: Uuid,
    ) -> CredentialResult<Vec<WebAuthnCredential>> {
        let state = self.state.lock().await;
        Ok(state
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn advance_sign_count(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
        sign_count: u32,
    ) -> CredentialResult<Conditional<WebAuthnCredential>> {
        let mut state = self.state.lock().await;
        let Some(stored) = state
            .credentials
            .iter_mut()
            .find(|c| c.credential_id == credential_id && c.user_id == user_id)
        else {
            return Ok(Conditional::Rejected(Rejection::Missing));
        };
        if sign_count <= stored.sign_count {
            return Ok(Conditional::Rejected(Rejection::Regressed {
                stored: stored.sign_count,
            }));
        }
        stored.sign_count = sign_count;
        stored.last_used_at = Utc::now();
        Ok(Conditional::Applied(stored.clone()))
    }

    async fn flag_cloned_credential(&self, credential_id: &[u8]) -> CredentialResult<bool> {
        let mut state = self.state.lock().await;
        match state
            .credentials
            .iter_mut()
            .find(|c| c.credential_id == credential_id)
        {
            Some(stored) => {
                stored.clone_suspected_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

//! Access code races between lookup, revocation and use.
//!
//! `RevokeOnLookup` wraps the in-memory store and revokes a code right after
//! it has been looked up by hash, which is the widest window a concurrent
//! revocation can hit during verification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credential_core::access_code::{AccessCode, AccessCodeRequest, CreateMode, hash_access_code};
use credential_core::email_token::{EmailToken, EmailTokenKind};
use credential_core::store::{Conditional, CredentialStore};
use credential_core::tokens::RefreshToken;
use credential_core::webauthn::{CeremonyKind, WebAuthnCredential, WebAuthnSession};
use credential_core::{
    AccessCodeManager, CoreConfig, CredentialError, CredentialResult, MemoryCredentialStore,
};
use std::sync::Arc;
use uuid::Uuid;

struct RevokeOnLookup {
    inner: MemoryCredentialStore,
}

#[async_trait]
impl CredentialStore for RevokeOnLookup {
    async fn access_code_by_hash(&self, code_hash: &str) -> CredentialResult<Option<AccessCode>> {
        let found = self.inner.access_code_by_hash(code_hash).await?;
        if let Some(code) = &found {
            self.inner.revoke_access_code(code.id).await?;
        }
        Ok(found)
    }

    async fn insert_access_code(&self, code: &AccessCode, mode: CreateMode) -> CredentialResult<Conditional<()>> {
        self.inner.insert_access_code(code, mode).await
    }

    async fn active_access_code_for_user(&self, user_id: Uuid) -> CredentialResult<Option<AccessCode>> {
        self.inner.active_access_code_for_user(user_id).await
    }

    async fn increment_access_code_usage(&self, id: Uuid) -> CredentialResult<Conditional<AccessCode>> {
        self.inner.increment_access_code_usage(id).await
    }

    async fn claim_access_code_use(&self, id: Uuid) -> CredentialResult<Conditional<AccessCode>> {
        self.inner.claim_access_code_use(id).await
    }

    async fn revoke_access_code(&self, id: Uuid) -> CredentialResult<bool> {
        self.inner.revoke_access_code(id).await
    }

    async fn revoke_access_codes_for_user(&self, user_id: Uuid) -> CredentialResult<u64> {
        self.inner.revoke_access_codes_for_user(user_id).await
    }

    async fn access_codes_due_for_rotation(&self) -> CredentialResult<Vec<AccessCode>> {
        self.inner.access_codes_due_for_rotation().await
    }

    async fn claim_due_rotation(&self, id: Uuid, until: DateTime<Utc>) -> CredentialResult<bool> {
        self.inner.claim_due_rotation(id, until).await
    }

    async fn active_access_code_user_ids(&self) -> CredentialResult<Vec<Uuid>> {
        self.inner.active_access_code_user_ids().await
    }

    async fn set_next_rotation(&self, id: Uuid, next: DateTime<Utc>) -> CredentialResult<bool> {
        self.inner.set_next_rotation(id, next).await
    }

    async fn list_access_codes(&self, limit: i64) -> CredentialResult<Vec<AccessCode>> {
        self.inner.list_access_codes(limit).await
    }

    async fn insert_token_revocation(&self, token_id: Uuid, user_id: Uuid) -> CredentialResult<()> {
        self.inner.insert_token_revocation(token_id, user_id).await
    }

    async fn is_token_revoked(&self, token_id: Uuid) -> CredentialResult<bool> {
        self.inner.is_token_revoked(token_id).await
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> CredentialResult<()> {
        self.inner.insert_refresh_token(token).await
    }

    async fn refresh_token_by_hash(&self, token_hash: &str) -> CredentialResult<Option<RefreshToken>> {
        self.inner.refresh_token_by_hash(token_hash).await
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> CredentialResult<bool> {
        self.inner.revoke_refresh_token(token_hash).await
    }

    async fn rotate_refresh_token(&self, presented_hash: &str, successor: &RefreshToken) -> CredentialResult<Conditional<RefreshToken>> {
        self.inner.rotate_refresh_token(presented_hash, successor).await
    }

    async fn revoke_refresh_family(&self, family_id: Uuid) -> CredentialResult<u64> {
        self.inner.revoke_refresh_family(family_id).await
    }

    async fn revoke_refresh_tokens_for_user(&self, user_id: Uuid) -> CredentialResult<u64> {
        self.inner.revoke_refresh_tokens_for_user(user_id).await
    }

    async fn insert_email_token(&self, kind: EmailTokenKind, token: &EmailToken) -> CredentialResult<()> {
        self.inner.insert_email_token(kind, token).await
    }

    async fn claim_email_token(&self, kind: EmailTokenKind, token: &str) -> CredentialResult<Conditional<Uuid>> {
        self.inner.claim_email_token(kind, token).await
    }

    async fn insert_webauthn_session(&self, session: &WebAuthnSession) -> CredentialResult<()> {
        self.inner.insert_webauthn_session(session).await
    }

    async fn latest_webauthn_session(&self, user_id: Uuid, kind: CeremonyKind) -> CredentialResult<Option<WebAuthnSession>> {
        self.inner.latest_webauthn_session(user_id, kind).await
    }

    async fn consume_webauthn_session(&self, session_id: Uuid, user_id: Uuid, kind: CeremonyKind) -> CredentialResult<Conditional<WebAuthnSession>> {
        self.inner.consume_webauthn_session(session_id, user_id, kind).await
    }

    async fn upsert_webauthn_credential(&self, credential: &WebAuthnCredential) -> CredentialResult<Conditional<WebAuthnCredential>> {
        self.inner.upsert_webauthn_credential(credential).await
    }

    async fn webauthn_credentials_for_user(&self, user_id: Uuid) -> CredentialResult<Vec<WebAuthnCredential>> {
        self.inner.webauthn_credentials_for_user(user_id).await
    }

    async fn advance_sign_count(&self, user_id: Uuid, credential_id: &[u8], sign_count: u32) -> CredentialResult<Conditional<WebAuthnCredential>> {
        self.inner.advance_sign_count(user_id, credential_id, sign_count).await
    }

    async fn flag_cloned_credential(&self, credential_id: &[u8]) -> CredentialResult<bool> {
        self.inner.flag_cloned_credential(credential_id).await
    }
}

fn manager_over(store: Arc<dyn CredentialStore>) -> AccessCodeManager {
    AccessCodeManager::new(store, &CoreConfig::default())
}

#[tokio::test]
async fn test_revocation_between_lookup_and_use_rejects() {
    let store = Arc::new(RevokeOnLookup {
        inner: MemoryCredentialStore::new(),
    });
    let manager = manager_over(store.clone());
    let user_id = Uuid::new_v4();
    let issued = manager
        .create(AccessCodeRequest::for_user(user_id))
        .await
        .unwrap();

    let result = manager
        .verify(&hash_access_code(&issued.code), Some(user_id), "portal")
        .await;
    assert!(matches!(result, Err(CredentialError::Revoked)), "got {result:?}");

    let stored = store
        .inner
        .access_code_by_hash(&issued.record.code_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.usage_count, 0);
    assert!(stored.last_used_at.is_none());
    assert!(stored.revoked_at.is_some());
}

#[tokio::test]
async fn test_non_owner_sees_not_found_for_revoked_code() {
    let manager = manager_over(Arc::new(MemoryCredentialStore::new()));
    let owner = Uuid::new_v4();
    let issued = manager
        .create(AccessCodeRequest::for_user(owner))
        .await
        .unwrap();
    manager.revoke(issued.record.id).await.unwrap();

    let hash = hash_access_code(&issued.code);
    assert!(matches!(
        manager.verify(&hash, Some(Uuid::new_v4()), "admin").await,
        Err(CredentialError::NotFound(_))
    ));
    assert!(matches!(
        manager.verify(&hash, Some(owner), "portal").await,
        Err(CredentialError::Revoked)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_verification_respects_max_uses() {
    let manager = manager_over(Arc::new(MemoryCredentialStore::new()));
    let user_id = Uuid::new_v4();
    let issued = manager
        .create(AccessCodeRequest {
            max_uses: Some(3),
            ..AccessCodeRequest::for_user(user_id)
        })
        .await
        .unwrap();
    let hash = hash_access_code(&issued.code);

    let mut handles = Vec::new();
    for _ in 0..12 {
        let manager = manager.clone();
        let hash = hash.clone();
        handles.push(tokio::spawn(async move {
            manager.verify(&hash, Some(user_id), "portal").await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(CredentialError::Exhausted) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 3);

    let stored = manager.get_by_hash(&hash).await.unwrap();
    assert_eq!(stored.usage_count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mark_used_never_exceeds_cap() {
    let manager = manager_over(Arc::new(MemoryCredentialStore::new()));
    let issued = manager
        .create(AccessCodeRequest {
            max_uses: Some(5),
            ..AccessCodeRequest::default()
        })
        .await
        .unwrap();
    let id = issued.record.id;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.mark_used(id).await }));
    }

    let mut successes = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(CredentialError::Exhausted) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 5);
    assert_eq!(exhausted, 15);
}

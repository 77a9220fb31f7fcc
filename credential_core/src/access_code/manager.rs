//! Access code manager implementation.

use super::models::{
    AccessCode, AccessCodeRequest, BulkRotation, CreateMode, IssuedAccessCode, UserRotation,
    WILDCARD_SCOPE,
};
use super::secret::generate_access_code;
use crate::config::CoreConfig;
use crate::db::timeouts::with_timeout;
use crate::error::{CredentialError, CredentialResult};
use crate::store::CredentialStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Largest page returned by [`AccessCodeManager::list`]
pub const MAX_LIST_LIMIT: i64 = 200;

const ENTITY: &str = "Access code";

const FALLBACK_ROTATION_CLEARANCE: &str = "government";

/// Access code manager
#[derive(Clone)]
pub struct AccessCodeManager {
    store: Arc<dyn CredentialStore>,
    default_rotation_hours: i32,
    timeout: Duration,
}

impl AccessCodeManager {
    /// Create a new access code manager
    ///
    /// # Arguments
    ///
    /// * `store` - Shared credential store
    /// * `config` - Rotation defaults and store timeout
    pub fn new(store: Arc<dyn CredentialStore>, config: &CoreConfig) -> Self {
        Self {
            store,
            default_rotation_hours: config.access_code_rotation_hours,
            timeout: config.store_timeout,
        }
    }

    /// Override the per-call store timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue a new code
    ///
    /// # Returns
    ///
    /// * `CredentialResult<IssuedAccessCode>` - The plaintext code (returned only here) and its record
    ///
    /// # Errors
    ///
    /// * `CredentialError::Conflict` - The subject already holds an active code
    pub async fn create(&self, request: AccessCodeRequest) -> CredentialResult<IssuedAccessCode> {
        self.issue(request, CreateMode::RejectIfActive).await
    }

    /// Revoke the subject's active code(s) and issue a new one in a single step
    pub async fn replace_for_user(
        &self,
        request: AccessCodeRequest,
    ) -> CredentialResult<IssuedAccessCode> {
        self.issue(request, CreateMode::ReplaceActive).await
    }

    /// Re-issue `user_id`'s code with the attributes of the current one
    ///
    /// A subject without an active code gets a `government` clearance code
    /// valid for every scope.
    pub async fn rotate_for_user(
        &self,
        user_id: Uuid,
        created_by: Option<Uuid>,
    ) -> CredentialResult<IssuedAccessCode> {
        self.rotate_user(user_id, created_by)
            .await
            .map(|rotation| rotation.issued)
    }

    /// Rotate the code of every subject that currently holds an active one
    ///
    /// A failure for one subject is logged and counted, and the remaining
    /// subjects are still rotated.
    pub async fn rotate_all_active(
        &self,
        created_by: Option<Uuid>,
    ) -> CredentialResult<BulkRotation> {
        let user_ids = self.active_user_ids().await?;
        let mut outcome = BulkRotation::default();

        for user_id in user_ids {
            match self.rotate_user(user_id, created_by).await {
                Ok(rotation) => outcome.rotated.push(rotation),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to rotate access code");
                    outcome.failed += 1;
                }
            }
        }

        tracing::info!(
            rotated = outcome.rotated.len(),
            failed = outcome.failed,
            created_by = ?created_by,
            "Rotated all active access codes"
        );
        Ok(outcome)
    }

    async fn rotate_user(
        &self,
        user_id: Uuid,
        created_by: Option<Uuid>,
    ) -> CredentialResult<UserRotation> {
        let (previous_code_id, request) = match self.get_active_for_user(user_id).await {
            Ok(existing) => {
                let request = AccessCodeRequest::reissue_of(&existing);
                let request = AccessCodeRequest {
                    created_by: created_by.or(request.created_by),
                    ..request
                };
                (Some(existing.id), request)
            }
            Err(CredentialError::NotFound(_)) => (
                None,
                AccessCodeRequest {
                    created_by,
                    clearance_level: Some(FALLBACK_ROTATION_CLEARANCE.to_string()),
                    scope: Some(WILDCARD_SCOPE.to_string()),
                    ..AccessCodeRequest::for_user(user_id)
                },
            ),
            Err(e) => return Err(e),
        };

        let issued = self.replace_for_user(request).await?;
        Ok(UserRotation {
            user_id,
            previous_code_id,
            issued,
        })
    }

    async fn issue(
        &self,
        request: AccessCodeRequest,
        mode: CreateMode,
    ) -> CredentialResult<IssuedAccessCode> {
        let material = generate_access_code();
        let record = request.into_record(
            material.hash,
            material.last4,
            self.default_rotation_hours,
            Utc::now(),
        );

        with_timeout(self.timeout, self.store.insert_access_code(&record, mode))
            .await?
            .into_result(ENTITY)?;

        tracing::info!(
            code_id = %record.id,
            user_id = ?record.user_id,
            scope = %record.scope,
            expires_at = %record.expires_at,
            replaced = mode == CreateMode::ReplaceActive,
            "Issued access code"
        );

        Ok(IssuedAccessCode {
            code: material.code,
            record,
        })
    }

    /// Most recently issued active code of `user_id`
    pub async fn get_active_for_user(&self, user_id: Uuid) -> CredentialResult<AccessCode> {
        with_timeout(self.timeout, self.store.active_access_code_for_user(user_id))
            .await?
            .ok_or(CredentialError::NotFound(ENTITY))
    }

    /// Exact-match lookup by code hash, in any state
    pub async fn get_by_hash(&self, code_hash: &str) -> CredentialResult<AccessCode> {
        with_timeout(self.timeout, self.store.access_code_by_hash(code_hash))
            .await?
            .ok_or(CredentialError::NotFound(ENTITY))
    }

    /// Count one use, enforcing `max_uses` atomically
    ///
    /// # Errors
    ///
    /// * `CredentialError::Exhausted` - The code already reached its cap
    /// * `CredentialError::NotFound` - No such code
    pub async fn mark_used(&self, id: Uuid) -> CredentialResult<AccessCode> {
        with_timeout(self.timeout, self.store.increment_access_code_usage(id))
            .await?
            .into_result(ENTITY)
    }

    /// Revoke a single code; revoking twice is a no-op
    pub async fn revoke(&self, id: Uuid) -> CredentialResult<()> {
        if !with_timeout(self.timeout, self.store.revoke_access_code(id)).await? {
            return Err(CredentialError::NotFound(ENTITY));
        }
        tracing::info!(code_id = %id, "Revoked access code");
        Ok(())
    }

    /// Revoke every non-revoked code of `user_id`, returning how many were revoked
    pub async fn revoke_by_user(&self, user_id: Uuid) -> CredentialResult<u64> {
        let revoked =
            with_timeout(self.timeout, self.store.revoke_access_codes_for_user(user_id)).await?;
        tracing::info!(user_id = %user_id, revoked, "Revoked access codes for user");
        Ok(revoked)
    }

    /// Live codes whose `next_rotation_at` has passed
    pub async fn list_rotation_due(&self) -> CredentialResult<Vec<AccessCode>> {
        with_timeout(self.timeout, self.store.access_codes_due_for_rotation()).await
    }

    /// Distinct subjects holding at least one active code
    pub async fn active_user_ids(&self) -> CredentialResult<Vec<Uuid>> {
        with_timeout(self.timeout, self.store.active_access_code_user_ids()).await
    }

    /// Take a due code for rotation by pushing its schedule to `until`
    ///
    /// Returns false when the code is no longer due, typically because
    /// another sweeper claimed it first.
    pub async fn claim_rotation(&self, id: Uuid, until: DateTime<Utc>) -> CredentialResult<bool> {
        with_timeout(self.timeout, self.store.claim_due_rotation(id, until)).await
    }

    /// Move a code's rotation schedule to `next`
    pub async fn update_rotation(&self, id: Uuid, next: DateTime<Utc>) -> CredentialResult<()> {
        if with_timeout(self.timeout, self.store.set_next_rotation(id, next)).await? {
            Ok(())
        } else {
            Err(CredentialError::NotFound(ENTITY))
        }
    }

    /// Newest codes first; `limit` is clamped to `1..=200`
    pub async fn list(&self, limit: i64) -> CredentialResult<Vec<AccessCode>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        with_timeout(self.timeout, self.store.list_access_codes(limit)).await
    }

    /// Validate a presented code and count the use
    ///
    /// `scope` may be empty to accept any scope. When `expected_user` is set,
    /// a code belonging to anyone else is reported as not found before any
    /// of its state is inspected. Liveness and the usage cap are decided by
    /// the same atomic claim that counts the use.
    ///
    /// # Errors
    ///
    /// * `CredentialError::NotFound` - Unknown hash or wrong owner
    /// * `CredentialError::ScopeMismatch` - Code does not grant `scope`
    /// * `CredentialError::Revoked` / `CredentialError::Expired` - Code is no longer live
    /// * `CredentialError::Exhausted` - Usage cap reached
    pub async fn verify(
        &self,
        code_hash: &str,
        expected_user: Option<Uuid>,
        scope: &str,
    ) -> CredentialResult<AccessCode> {
        let record = self.get_by_hash(code_hash).await?;

        if let Some(user_id) = expected_user {
            if record.user_id != Some(user_id) {
                tracing::warn!(code_id = %record.id, user_id = %user_id, "Access code presented by non-owner");
                return Err(CredentialError::NotFound(ENTITY));
            }
        }
        if !record.allows_scope(scope) {
            return Err(CredentialError::ScopeMismatch);
        }

        with_timeout(self.timeout, self.store.claim_access_code_use(record.id))
            .await?
            .into_result(ENTITY)
    }
}

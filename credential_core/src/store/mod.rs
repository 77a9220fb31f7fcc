//! Credential store abstraction.
//!
//! [`CredentialStore`] is the only seam between the managers and durable
//! state. Every method that decides a race (claims, increments, rotations)
//! must be atomic in the implementation: either one conditional statement or
//! one transaction. Managers never emulate atomicity with a read followed by
//! a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::access_code::{AccessCode, CreateMode};
use crate::email_token::{EmailToken, EmailTokenKind};
use crate::error::{CredentialError, CredentialResult};
use crate::tokens::RefreshToken;
use crate::webauthn::{CeremonyKind, WebAuthnCredential, WebAuthnSession};

pub mod memory;
pub mod postgres;

pub use memory::MemoryCredentialStore;
pub use postgres::PgCredentialStore;

/// Why a conditional update matched no row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No row with that key
    Missing,
    /// Single-use artifact already claimed
    AlreadyUsed,
    /// Row exists but is past its expiry
    Expired,
    /// Row exists but was revoked
    Revoked,
    /// Usage cap reached
    Exhausted,
    /// Presented WebAuthn counter did not exceed the stored one
    Regressed { stored: u32 },
    /// A refresh token that was already rotated was presented again
    Replayed { family_id: Uuid, user_id: Uuid },
    /// Key belongs to another user
    OwnedByOther,
    /// Subject already holds an active access code
    ActiveExists,
}

impl Rejection {
    /// Map to the public error taxonomy; `what` names the entity for `NotFound`
    pub fn into_error(self, what: &'static str) -> CredentialError {
        match self {
            Rejection::Missing => CredentialError::NotFound(what),
            Rejection::AlreadyUsed => CredentialError::AlreadyUsed,
            Rejection::Expired => CredentialError::Expired,
            Rejection::Revoked | Rejection::Replayed { .. } => CredentialError::Revoked,
            Rejection::Exhausted => CredentialError::Exhausted,
            Rejection::Regressed { .. } => CredentialError::CloneDetected,
            Rejection::OwnedByOther => {
                CredentialError::Conflict(format!("{what} is registered to another user"))
            }
            Rejection::ActiveExists => {
                CredentialError::Conflict(format!("subject already holds an active {what}"))
            }
        }
    }
}

/// Outcome of a conditional update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional<T> {
    Applied(T),
    Rejected(Rejection),
}

impl<T> Conditional<T> {
    /// Convert into a result, mapping rejections with [`Rejection::into_error`]
    pub fn into_result(self, what: &'static str) -> CredentialResult<T> {
        match self {
            Conditional::Applied(value) => Ok(value),
            Conditional::Rejected(rejection) => Err(rejection.into_error(what)),
        }
    }
}

/// Durable store for every credential entity
#[async_trait]
pub trait CredentialStore: Send + Sync {
    // ---- access codes ----

    /// Insert a code, honoring the one-active-code-per-subject rule per `mode`
    async fn insert_access_code(
        &self,
        code: &AccessCode,
        mode: CreateMode,
    ) -> CredentialResult<Conditional<()>>;

    /// Most recently issued active code of a subject
    async fn active_access_code_for_user(&self, user_id: Uuid)
    -> CredentialResult<Option<AccessCode>>;

    /// Exact-match lookup by code hash, regardless of state
    async fn access_code_by_hash(&self, code_hash: &str) -> CredentialResult<Option<AccessCode>>;

    /// Atomically increment usage if under `max_uses`, returning the updated row
    async fn increment_access_code_usage(
        &self,
        id: Uuid,
    ) -> CredentialResult<Conditional<AccessCode>>;

    /// Count one use iff the code is live and under `max_uses`, returning the updated row
    ///
    /// Revocation, expiry and the cap are all decided by the same atomic step.
    async fn claim_access_code_use(&self, id: Uuid) -> CredentialResult<Conditional<AccessCode>>;

    /// Revoke one code; false if no such code
    async fn revoke_access_code(&self, id: Uuid) -> CredentialResult<bool>;

    /// Revoke every non-revoked code of a subject, returning how many changed
    async fn revoke_access_codes_for_user(&self, user_id: Uuid) -> CredentialResult<u64>;

    /// Non-revoked codes with `next_rotation_at <= now`
    async fn access_codes_due_for_rotation(&self) -> CredentialResult<Vec<AccessCode>>;

    /// Push a due code's `next_rotation_at` to `until` iff it is still due and live
    ///
    /// At most one of several concurrent callers gets `true` for the same due row.
    async fn claim_due_rotation(&self, id: Uuid, until: DateTime<Utc>) -> CredentialResult<bool>;

    /// Distinct subjects holding at least one active code
    async fn active_access_code_user_ids(&self) -> CredentialResult<Vec<Uuid>>;

    /// Set `next_rotation_at`; false if no such code
    async fn set_next_rotation(&self, id: Uuid, next: DateTime<Utc>) -> CredentialResult<bool>;

    /// Newest codes first
    async fn list_access_codes(&self, limit: i64) -> CredentialResult<Vec<AccessCode>>;

    // ---- JWT deny-list ----

    /// Add a token id to the deny-list; repeated inserts are no-ops
    async fn insert_token_revocation(&self, token_id: Uuid, user_id: Uuid)
    -> CredentialResult<()>;

    /// Membership check on the deny-list
    async fn is_token_revoked(&self, token_id: Uuid) -> CredentialResult<bool>;

    // ---- refresh tokens ----

    async fn insert_refresh_token(&self, token: &RefreshToken) -> CredentialResult<()>;

    /// Lookup by hash, regardless of state
    async fn refresh_token_by_hash(&self, token_hash: &str)
    -> CredentialResult<Option<RefreshToken>>;

    /// Revoke one token; false if it was unknown or already revoked
    async fn revoke_refresh_token(&self, token_hash: &str) -> CredentialResult<bool>;

    /// Atomically retire `presented_hash` and insert `successor` into its family
    ///
    /// `successor.family_id` and `successor.user_id` are overwritten with the
    /// presented token's values. Returns the retired token.
    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor: &RefreshToken,
    ) -> CredentialResult<Conditional<RefreshToken>>;

    /// Revoke every live token of a family
    async fn revoke_refresh_family(&self, family_id: Uuid) -> CredentialResult<u64>;

    /// Revoke every live token of a user
    async fn revoke_refresh_tokens_for_user(&self, user_id: Uuid) -> CredentialResult<u64>;

    // ---- email tokens ----

    async fn insert_email_token(
        &self,
        kind: EmailTokenKind,
        token: &EmailToken,
    ) -> CredentialResult<()>;

    /// Set `used_at` iff unused and unexpired, returning the owning user
    async fn claim_email_token(
        &self,
        kind: EmailTokenKind,
        token: &str,
    ) -> CredentialResult<Conditional<Uuid>>;

    // ---- WebAuthn ----

    async fn insert_webauthn_session(&self, session: &WebAuthnSession) -> CredentialResult<()>;

    /// Most recent unexpired, unconsumed session of that type
    async fn latest_webauthn_session(
        &self,
        user_id: Uuid,
        kind: CeremonyKind,
    ) -> CredentialResult<Option<WebAuthnSession>>;

    /// Mark a session consumed iff it belongs to `user_id`/`kind`, is unconsumed and unexpired
    async fn consume_webauthn_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        kind: CeremonyKind,
    ) -> CredentialResult<Conditional<WebAuthnSession>>;

    /// Insert or update by credential id; `sign_count` never decreases
    async fn upsert_webauthn_credential(
        &self,
        credential: &WebAuthnCredential,
    ) -> CredentialResult<Conditional<WebAuthnCredential>>;

    async fn webauthn_credentials_for_user(
        &self,
        user_id: Uuid,
    ) -> CredentialResult<Vec<WebAuthnCredential>>;

    /// Store `sign_count` iff it is strictly greater than the stored value
    async fn advance_sign_count(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
        sign_count: u32,
    ) -> CredentialResult<Conditional<WebAuthnCredential>>;

    /// Stamp `clone_suspected_at`
    async fn flag_cloned_credential(&self, credential_id: &[u8]) -> CredentialResult<bool>;
}

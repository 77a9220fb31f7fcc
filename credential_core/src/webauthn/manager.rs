//! Passkey credential and ceremony session manager.
//!
//! Attestation and assertion signatures are verified by the caller's WebAuthn
//! library. This manager owns what must survive between requests: the
//! ceremony session and its challenge, enrolled credentials, and the
//! authenticator sign counter used for clone detection.

use super::models::{
    CeremonyChallenge, CeremonyKind, CeremonyResponse, NewCredential, VerifiedCeremony,
    WebAuthnCredential, WebAuthnSession,
};
use crate::config::CoreConfig;
use crate::db::timeouts::with_timeout;
use crate::error::{CredentialError, CredentialResult};
use crate::store::{Conditional, CredentialStore, Rejection};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

const CREDENTIAL: &str = "WebAuthn credential";
const SESSION: &str = "WebAuthn session";

/// WebAuthn credential store and ceremony tracker
#[derive(Clone)]
pub struct WebAuthnManager {
    store: Arc<dyn CredentialStore>,
    session_ttl: Duration,
    allow_zero_sign_count: bool,
    timeout: StdDuration,
}

impl WebAuthnManager {
    pub fn new(store: Arc<dyn CredentialStore>, config: &CoreConfig) -> Self {
        Self {
            store,
            session_ttl: config.webauthn_session_ttl,
            allow_zero_sign_count: config.allow_zero_sign_count,
            timeout: config.store_timeout,
        }
    }

    /// Override the per-call store timeout
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Persist an in-flight ceremony, returning its session id
    ///
    /// # Arguments
    ///
    /// * `user_id` - User performing the ceremony
    /// * `kind` - Registration or authentication
    /// * `challenge` - Challenge sent to the authenticator
    /// * `session_data` - Opaque state from the WebAuthn library, stored as JSON
    /// * `expires_at` - Absolute expiry of the session
    pub async fn store_session<T: Serialize>(
        &self,
        user_id: Uuid,
        kind: CeremonyKind,
        challenge: &str,
        session_data: &T,
        expires_at: DateTime<Utc>,
    ) -> CredentialResult<Uuid> {
        let session = WebAuthnSession {
            id: Uuid::new_v4(),
            user_id,
            session_type: kind,
            challenge: challenge.to_string(),
            session_data: serde_json::to_value(session_data)?,
            expires_at,
            consumed_at: None,
            created_at: Utc::now(),
        };
        with_timeout(self.timeout, self.store.insert_webauthn_session(&session)).await?;
        tracing::debug!(session_id = %session.id, user_id = %user_id, kind = %kind, "Stored WebAuthn session");
        Ok(session.id)
    }

    /// Most recent unexpired, unconsumed session of `kind`
    ///
    /// Ceremonies address sessions by id; this lookup exists for callers that
    /// track only the user.
    pub async fn get_latest_session(
        &self,
        user_id: Uuid,
        kind: CeremonyKind,
    ) -> CredentialResult<WebAuthnSession> {
        with_timeout(self.timeout, self.store.latest_webauthn_session(user_id, kind))
            .await?
            .ok_or(CredentialError::NotFound(SESSION))
    }

    /// Insert or update a credential by id; the stored sign count never decreases
    ///
    /// # Errors
    ///
    /// * `CredentialError::Conflict` - The credential id is enrolled by another user
    pub async fn upsert_credential(
        &self,
        user_id: Uuid,
        credential: NewCredential,
    ) -> CredentialResult<WebAuthnCredential> {
        let record = credential.into_credential(user_id, Utc::now());
        let stored = with_timeout(self.timeout, self.store.upsert_webauthn_credential(&record))
            .await?
            .into_result(CREDENTIAL)?;
        tracing::info!(user_id = %user_id, aaguid = %stored.aaguid, "Upserted WebAuthn credential");
        Ok(stored)
    }

    pub async fn get_credentials_by_user_id(
        &self,
        user_id: Uuid,
    ) -> CredentialResult<Vec<WebAuthnCredential>> {
        with_timeout(self.timeout, self.store.webauthn_credentials_for_user(user_id)).await
    }

    /// Record a verified assertion, enforcing a strictly increasing sign count
    ///
    /// A count that does not advance flags the credential and fails with
    /// `CloneDetected`. When zero counters are allowed, a stored and presented
    /// count of zero is accepted as an authenticator without a counter.
    pub async fn record_assertion(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
        sign_count: u32,
    ) -> CredentialResult<WebAuthnCredential> {
        let outcome = with_timeout(
            self.timeout,
            self.store.advance_sign_count(user_id, credential_id, sign_count),
        )
        .await?;

        match outcome {
            Conditional::Applied(credential) => Ok(credential),
            Conditional::Rejected(Rejection::Regressed { stored: 0 })
                if sign_count == 0 && self.allow_zero_sign_count =>
            {
                self.touch_counterless(user_id, credential_id).await
            }
            Conditional::Rejected(Rejection::Regressed { stored }) => {
                with_timeout(self.timeout, self.store.flag_cloned_credential(credential_id))
                    .await?;
                tracing::warn!(
                    user_id = %user_id,
                    credential_id = %hex::encode(credential_id),
                    stored,
                    presented = sign_count,
                    "WebAuthn sign count regression, credential flagged as cloned"
                );
                Err(CredentialError::CloneDetected)
            }
            Conditional::Rejected(rejection) => Err(rejection.into_error(CREDENTIAL)),
        }
    }

    async fn touch_counterless(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
    ) -> CredentialResult<WebAuthnCredential> {
        let current = self
            .get_credentials_by_user_id(user_id)
            .await?
            .into_iter()
            .find(|c| c.credential_id == credential_id)
            .ok_or(CredentialError::NotFound(CREDENTIAL))?;

        with_timeout(self.timeout, self.store.upsert_webauthn_credential(&current))
            .await?
            .into_result(CREDENTIAL)
    }

    /// Start a ceremony: mint a challenge and persist the session
    pub async fn begin_ceremony<T: Serialize>(
        &self,
        user_id: Uuid,
        kind: CeremonyKind,
        session_data: &T,
    ) -> CredentialResult<CeremonyChallenge> {
        let challenge = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
        let expires_at = Utc::now() + self.session_ttl;
        let session_id = self
            .store_session(user_id, kind, &challenge, session_data, expires_at)
            .await?;

        Ok(CeremonyChallenge {
            session_id,
            challenge,
            expires_at,
        })
    }

    /// Finish a ceremony whose response the caller already verified
    ///
    /// The session is consumed before anything else, so a session completes
    /// at most once even when the echoed challenge turns out to be wrong.
    ///
    /// # Errors
    ///
    /// * `CredentialError::Validation` - Outcome does not match `kind`, or challenge mismatch
    /// * `CredentialError::AlreadyUsed` / `CredentialError::Expired` - Session no longer usable
    /// * `CredentialError::NotFound` - Unknown session, or one owned by another user
    /// * `CredentialError::CloneDetected` - Assertion sign count did not advance
    pub async fn complete_ceremony(
        &self,
        user_id: Uuid,
        kind: CeremonyKind,
        response: CeremonyResponse,
    ) -> CredentialResult<WebAuthnCredential> {
        if response.outcome.kind() != kind {
            return Err(CredentialError::Validation(format!(
                "{} outcome cannot complete a {kind} ceremony",
                response.outcome.kind()
            )));
        }

        let session = with_timeout(
            self.timeout,
            self.store
                .consume_webauthn_session(response.session_id, user_id, kind),
        )
        .await?
        .into_result(SESSION)?;

        let matches: bool = session
            .challenge
            .as_bytes()
            .ct_eq(response.challenge.as_bytes())
            .into();
        if !matches {
            tracing::warn!(
                user_id = %user_id,
                session_id = %session.id,
                "WebAuthn challenge mismatch"
            );
            return Err(CredentialError::Validation(
                "challenge does not match session".to_string(),
            ));
        }

        match response.outcome {
            VerifiedCeremony::Registered(credential) => {
                self.upsert_credential(user_id, credential).await
            }
            VerifiedCeremony::Asserted {
                credential_id,
                sign_count,
            } => {
                self.record_assertion(user_id, &credential_id, sign_count)
                    .await
            }
        }
    }
}

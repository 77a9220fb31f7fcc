//! WebAuthn credential and ceremony models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ceremony type recorded on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeremonyKind {
    Registration,
    Authentication,
}

impl CeremonyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CeremonyKind::Registration => "registration",
            CeremonyKind::Authentication => "authentication",
        }
    }
}

impl std::fmt::Display for CeremonyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CeremonyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration" => Ok(CeremonyKind::Registration),
            "authentication" => Ok(CeremonyKind::Authentication),
            other => Err(format!("unknown ceremony kind: {other}")),
        }
    }
}

/// Enrolled passkey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAuthnCredential {
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub attestation_type: String,
    pub transports: Vec<String>,
    pub sign_count: u32,
    /// Hex-encoded authenticator AAGUID
    pub aaguid: String,
    pub last_used_at: DateTime<Utc>,
    /// Set when a sign-count regression was observed
    pub clone_suspected_at: Option<DateTime<Utc>>,
}

/// Credential data produced by a verified registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCredential {
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub attestation_type: String,
    pub transports: Vec<String>,
    pub sign_count: u32,
    pub aaguid: String,
}

impl NewCredential {
    pub(crate) fn into_credential(self, user_id: Uuid, now: DateTime<Utc>) -> WebAuthnCredential {
        WebAuthnCredential {
            user_id,
            credential_id: self.credential_id,
            public_key: self.public_key,
            attestation_type: self.attestation_type,
            transports: self.transports,
            sign_count: self.sign_count,
            aaguid: self.aaguid.to_lowercase(),
            last_used_at: now,
            clone_suspected_at: None,
        }
    }
}

/// In-flight ceremony
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebAuthnSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_type: CeremonyKind,
    pub challenge: String,
    /// Opaque state from the caller's WebAuthn library
    pub session_data: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Returned by `begin_ceremony`; the client echoes `session_id` on completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyChallenge {
    pub session_id: Uuid,
    pub challenge: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a ceremony already verified by the caller's WebAuthn library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifiedCeremony {
    /// A new credential was attested
    Registered(NewCredential),
    /// An existing credential produced an assertion
    Asserted {
        credential_id: Vec<u8>,
        sign_count: u32,
    },
}

impl VerifiedCeremony {
    pub fn kind(&self) -> CeremonyKind {
        match self {
            VerifiedCeremony::Registered(_) => CeremonyKind::Registration,
            VerifiedCeremony::Asserted { .. } => CeremonyKind::Authentication,
        }
    }
}

/// Ceremony completion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyResponse {
    pub session_id: Uuid,
    /// Challenge echoed back in the client data
    pub challenge: String,
    pub outcome: VerifiedCeremony,
}

//! WebAuthn passkey credentials and ceremony sessions.

pub mod manager;
pub mod models;

pub use manager::WebAuthnManager;
pub use models::{
    CeremonyChallenge, CeremonyKind, CeremonyResponse, NewCredential, VerifiedCeremony,
    WebAuthnCredential, WebAuthnSession,
};

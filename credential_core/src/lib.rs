//! # Credential Core
//!
//! Issues, validates, rotates and revokes authentication artifacts against a
//! shared durable store:
//!
//! - rotating shared-secret **access codes** ([`access_code`])
//! - a **JWT deny-list** and rotating **refresh tokens** ([`tokens`])
//! - single-use **email verification / password reset tokens** ([`email_token`])
//! - **WebAuthn passkeys** and their ceremony sessions ([`webauthn`])
//!
//! Every manager talks to storage only through [`store::CredentialStore`].
//! Races (single-use claims, usage caps, counter advances, token rotation)
//! are decided by the store in one conditional statement or transaction, so
//! any number of request handlers can share one store.
//!
//! ## Example
//!
//! ```
//! use credential_core::{CoreConfig, CredentialCore, EmailTokenKind, MemoryCredentialStore};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), credential_core::CredentialError> {
//! let core = CredentialCore::new(Arc::new(MemoryCredentialStore::new()), &CoreConfig::default());
//! let user_id = uuid::Uuid::new_v4().to_string();
//!
//! let token = core.issue_email_token(EmailTokenKind::Verification, &user_id).await?;
//! let owner = core.consume_email_token(EmailTokenKind::Verification, &token).await?;
//! assert_eq!(owner.to_string(), user_id);
//! # Ok(())
//! # }
//! ```

/// Rotating shared-secret access codes.
pub mod access_code;

/// Lifecycle configuration.
pub mod config;

/// PostgreSQL pool and timeout helpers.
pub mod db;

/// Single-use email tokens.
pub mod email_token;

/// Error taxonomy.
pub mod error;

/// Operation facade over all managers.
pub mod facade;

/// Storage abstraction and implementations.
pub mod store;

/// Periodic access code rotation.
pub mod sweep;

/// JWT deny-list and refresh tokens.
pub mod tokens;

/// WebAuthn credentials and ceremonies.
pub mod webauthn;

pub use access_code::{AccessCodeManager, AccessCodeRequest, AccessCodeTarget};
pub use config::{ConfigError, CoreConfig};
pub use facade::CredentialCore;
pub use email_token::{EmailTokenKind, EmailTokenManager};
pub use error::{CredentialError, CredentialResult};
pub use store::{CredentialStore, MemoryCredentialStore, PgCredentialStore};
pub use sweep::{RotationNotifier, RotationSweep, SweepReport};
pub use tokens::{AuthTokenRegistry, ClientMeta, JwtCodec};
pub use webauthn::{CeremonyKind, WebAuthnManager};

//! Rotating shared-secret access codes.
//!
//! A subject holds at most one active code at a time. Codes are handed out
//! once in plaintext and afterwards exist only as a SHA-256 hash plus a
//! four-character display suffix.

pub mod manager;
pub mod models;
pub mod secret;

pub use manager::AccessCodeManager;
pub use models::{
    AccessCode, AccessCodeRequest, AccessCodeTarget, BulkRotation, CreateMode, DEFAULT_CLEARANCE,
    DEFAULT_SCOPE, IssuedAccessCode, UserRotation, WILDCARD_SCOPE,
};
pub use secret::{CodeMaterial, generate_access_code, hash_access_code};

//! Single-use email verification and password reset tokens.
//!
//! Each token moves `issued -> used` exactly once, or is found expired when
//! redeemed.

pub mod manager;
pub mod models;

pub use manager::EmailTokenManager;
pub use models::{EmailToken, EmailTokenKind};

//! JWT revocation deny-list and refresh token lifecycle.

pub mod jwt;
pub mod models;
pub mod refresh;
pub mod registry;

pub use jwt::JwtCodec;
pub use models::{AccessTokenClaims, ClientMeta, RefreshToken, TokenRevocation};
pub use refresh::{generate_refresh_token, hash_refresh_token};
pub use registry::AuthTokenRegistry;

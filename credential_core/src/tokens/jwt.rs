//! HS256 access token encoding and decoding.

use super::models::AccessTokenClaims;
use crate::error::CredentialResult;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

/// Signs and verifies access tokens with a shared secret
#[derive(Clone)]
pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for JwtCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtCodec").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl JwtCodec {
    /// Create a codec for `secret` issuing tokens valid for `ttl`
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Issue a token for `user_id`, returning it with its claims
    ///
    /// The `jti` is a fresh UUID so the token can later be deny-listed.
    pub fn issue(&self, user_id: Uuid, role: &str) -> CredentialResult<(String, AccessTokenClaims)> {
        let now = Utc::now();
        let claims = AccessTokenClaims {
            sub: user_id,
            jti: Uuid::new_v4(),
            role: role.to_string(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok((token, claims))
    }

    /// Verify signature and expiry, returning the claims
    ///
    /// Revocation is not checked here; see
    /// [`AuthTokenRegistry::verify_access_token`](super::AuthTokenRegistry::verify_access_token).
    pub fn decode(&self, token: &str) -> CredentialResult<AccessTokenClaims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<AccessTokenClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CredentialError;

    #[test]
    fn test_issue_then_decode() {
        let codec = JwtCodec::new(b"test_secret_key_for_jwt_signing_32b", Duration::minutes(15));
        let user_id = Uuid::new_v4();
        let (token, issued) = codec.issue(user_id, "civilian").unwrap();

        let claims = codec.decode(&token).unwrap();
        assert_eq!(claims, issued);
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.exp - claims.iat, 15 * 60);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let codec = JwtCodec::new(b"first_secret_first_secret_first__", Duration::minutes(5));
        let other = JwtCodec::new(b"second_secret_second_secret_secon", Duration::minutes(5));
        let (token, _) = codec.issue(Uuid::new_v4(), "civilian").unwrap();

        assert!(matches!(other.decode(&token), Err(CredentialError::Jwt(_))));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let codec = JwtCodec::new(b"expiry_secret_expiry_secret_expir", Duration::hours(-2));
        let (token, _) = codec.issue(Uuid::new_v4(), "civilian").unwrap();

        assert!(matches!(codec.decode(&token), Err(CredentialError::Jwt(_))));
    }
}

//! Refresh token material.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

/// Generate a refresh token: 32 random bytes, URL-safe base64 without padding
pub fn generate_refresh_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex SHA-256 of a refresh token, the only form that is stored
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_unique_and_url_safe() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = hash_refresh_token("token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_refresh_token("token"));
        assert_ne!(hash, hash_refresh_token("Token"));
    }
}

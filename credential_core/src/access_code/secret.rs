//! Access code material: generation and hashing.
//!
//! Codes look like `AG-K7Q2MZ4D-P9XW3RTB`. Only the SHA-256 of the
//! normalized code and its last four characters are ever persisted.

use sha2::{Digest, Sha256};

/// Prefix of every generated code
pub const CODE_PREFIX: &str = "AG";

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Plaintext code together with its stored forms
#[derive(Debug, Clone)]
pub struct CodeMaterial {
    pub code: String,
    pub hash: String,
    pub last4: String,
}

/// Generate a new random access code from 16 bytes of OS randomness
///
/// Each byte selects one base32 symbol; 256 is a multiple of 32 so the
/// mapping is unbiased.
pub fn generate_access_code() -> CodeMaterial {
    let entropy: [u8; 16] = rand::random();
    let symbols: String = entropy
        .iter()
        .map(|b| ALPHABET[usize::from(b & 0x1f)] as char)
        .collect();
    let code = format!("{CODE_PREFIX}-{}-{}", &symbols[..8], &symbols[8..]);

    CodeMaterial {
        hash: hash_access_code(&code),
        last4: last4(&code),
        code,
    }
}

/// Hash a user-supplied code for lookup
///
/// Input is trimmed and upper-cased first so that `ag-abcd...` and
/// `AG-ABCD...` resolve to the same row.
pub fn hash_access_code(code: &str) -> String {
    let normalized = code.trim().to_uppercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Display suffix stored alongside the hash
pub fn last4(code: &str) -> String {
    let normalized = code.trim().to_uppercase();
    let start = normalized
        .char_indices()
        .rev()
        .nth(3)
        .map_or(0, |(idx, _)| idx);
    normalized[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_code_shape() {
        let material = generate_access_code();
        let parts: Vec<&str> = material.code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], CODE_PREFIX);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert_eq!(material.last4, &parts[2][4..]);
        assert_eq!(material.hash, hash_access_code(&material.code));
    }

    #[test]
    fn test_hash_is_case_and_whitespace_insensitive() {
        assert_eq!(
            hash_access_code("  ag-abcdefgh-ijklmnop "),
            hash_access_code("AG-ABCDEFGH-IJKLMNOP")
        );
    }

    #[test]
    fn test_last4_of_short_input() {
        assert_eq!(last4("ab"), "AB");
    }
}

//! One-way hashing of user identifiers
//!
//! User identifiers never leave the device. Each signal carries a SHA-256
//! digest of the identifier instead, which lets the server count distinct
//! users without learning who they are.
//!
//! ## Encoding
//!
//! The identifier is hashed as UTF-16 little-endian code units, not UTF-8.
//! Other clients of the same ingestion service hash that way, and a user
//! must produce the same digest regardless of which client sent the signal.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of a user hash in hex characters (256-bit digest)
pub const USER_HASH_LEN: usize = 64;

/// Compute the user hash for an identifier
///
/// Returns a 64-character lowercase hex digest of SHA-256 over the
/// UTF-16LE encoding of `identifier`.
pub fn hash_user(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    for unit in identifier.encode_utf16() {
        hasher.update(unit.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Compute the user hash on the blocking pool
///
/// Keeps the digest off the caller's task. Fails only if the worker
/// panicked or was cancelled by runtime shutdown.
pub async fn hash_user_async(identifier: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_user(&identifier))
        .await
        .map_err(|e| Error::Hash(format!("hash worker failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let first = hash_user("alice@example.com");
        let second = hash_user("alice@example.com");
        assert_eq!(first, second);
        assert_ne!(first, hash_user("bob@example.com"));
    }

    #[test]
    fn test_hash_length_and_charset() {
        for input in ["", "a", "alice@example.com", "ünïcødé ✓"] {
            let hash = hash_user(input);
            assert_eq!(hash.len(), USER_HASH_LEN);
            assert!(hash
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    #[test]
    fn test_hash_uses_utf16le() {
        // "a" as UTF-16LE is [0x61, 0x00]
        let mut hasher = Sha256::new();
        hasher.update([0x61u8, 0x00]);
        let expected = hex::encode(hasher.finalize());
        assert_eq!(hash_user("a"), expected);

        // and differs from the UTF-8 digest of the same string
        let utf8 = hex::encode(Sha256::digest("a".as_bytes()));
        assert_ne!(hash_user("a"), utf8);
    }

    #[tokio::test]
    async fn test_hash_async_matches_sync() {
        let hash = hash_user_async("alice@example.com".to_string())
            .await
            .unwrap();
        assert_eq!(hash, hash_user("alice@example.com"));
    }
}

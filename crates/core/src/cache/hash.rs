//! Cache key derivation.
//!
//! The disk tier names its files after a digest of the resource identifier,
//! never after the identifier itself, so arbitrary URLs map onto fixed-length
//! lowercase hex that is safe on every filesystem.

use sha2::{Digest, Sha256};

/// Length in bytes of the digest kept for a cache key (128 bits).
const KEY_DIGEST_BYTES: usize = 16;

/// Length in characters of a derived cache key.
pub const KEY_LEN: usize = KEY_DIGEST_BYTES * 2;

/// Derive the disk-cache key for a resource identifier.
///
/// SHA-256 truncated to 128 bits, hex-encoded. Total over all inputs,
/// including the empty string.
pub fn derive_key(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    hex::encode(&digest[..KEY_DIGEST_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_stability() {
        let key1 = derive_key("https://example.com/a.jpg");
        let key2 = derive_key("https://example.com/a.jpg");
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_key_differs_by_identifier() {
        assert_ne!(derive_key("https://example.com/a.jpg"), derive_key("https://example.com/b.jpg"));
    }

    #[test]
    fn test_key_format() {
        for input in ["", "x", "https://example.com/😀?q=1#frag", &"a".repeat(10_000)] {
            let key = derive_key(input);
            assert_eq!(key.len(), KEY_LEN);
            assert!(key.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    #[test]
    fn test_no_collisions_across_many_inputs() {
        let mut seen = HashSet::new();
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        for i in 0..10_000u64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let identifier = format!("https://img.example.com/{i}/{state:x}.png");
            assert!(seen.insert(derive_key(&identifier)), "collision on {identifier}");
        }
        assert_eq!(seen.len(), 10_000);
    }
}

// Hashing and randomness primitives

use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of the hex prefix used for document keys
pub const KEY_HASH_LENGTH: usize = 32;

/// Hex-encoded SHA-256 digest
pub fn sha256_hex(input: &[u8]) -> String {
    format!("{:x}", Sha256::digest(input))
}

/// Derive the document key for a `(type, key)` pair.
///
/// `hash256(type + ":" + key + ":" + secret)[:32]`. The process-wide secret
/// keeps raw client identifiers (IPs, user ids, token ids) out of the store
/// and makes keys unguessable.
pub fn hash_key(secret: &str, key_type: &str, key: &str) -> String {
    let digest = sha256_hex(format!("{}:{}:{}", key_type, key, secret).as_bytes());
    digest[..KEY_HASH_LENGTH].to_string()
}

/// Random URL-safe token (CSRF tokens, device markers)
pub fn random_token(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// New random document identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Compare two secrets without leaking timing information
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_is_stable_and_truncated() {
        let a = hash_key("secret", "generate", "1.2.3.4:/generate");
        let b = hash_key("secret", "generate", "1.2.3.4:/generate");
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_HASH_LENGTH);
    }

    #[test]
    fn test_hash_key_depends_on_secret_and_type() {
        let base = hash_key("secret", "generate", "k");
        assert_ne!(base, hash_key("other-secret", "generate", "k"));
        assert_ne!(base, hash_key("secret", "payment", "k"));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_random_token_length() {
        let token = random_token(40);
        assert_eq!(token.len(), 40);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}

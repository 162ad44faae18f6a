//! Constant-time helpers for bearer tokens and admin keys.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time byte comparison that does not leak input lengths or content.
///
/// Both inputs are hashed to fixed-length SHA-256 digests before comparison,
/// then compared with `subtle::ConstantTimeEq`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let trimmed = header_value.trim();
    let (scheme, token) = trimmed.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// True if `presented` matches any of `keys`. Every key is compared.
pub fn matches_any_key(presented: &str, keys: &[String]) -> bool {
    keys.iter().fold(false, |found, key| {
        constant_time_eq(presented.as_bytes(), key.as_bytes()) | found
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn different_length_inputs_do_not_match() {
        assert!(!constant_time_eq(b"short", b"much longer string"));
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn any_key_matches() {
        let keys = vec!["k1".to_string(), "k2".to_string()];
        assert!(matches_any_key("k2", &keys));
        assert!(!matches_any_key("k3", &keys));
        assert!(!matches_any_key("k1", &[]));
    }
}

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over the given bytes using the shared secret.
/// Returns the hex-encoded MAC.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex HMAC-SHA256 signature in constant time.
/// Invalid hex is compared against zeros so the timing does not depend on it.
pub fn verify_hmac(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = hex::decode(signature).unwrap_or_else(|_| vec![0u8; 32]);
    mac.verify_slice(&expected).is_ok()
}

/// Identity hash of extended public key material, stored on wallet accounts.
pub fn key_material_hash(secret: &str, key_material: &str) -> String {
    compute_hmac(secret.trim().as_bytes(), key_material.trim().as_bytes())
}

/// `sha256=<hex>` over `timestamp + "." + body`.
pub fn webhook_signature(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let mut signed = Vec::with_capacity(body.len() + 24);
    signed.extend_from_slice(timestamp.to_string().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(body);
    format!("sha256={}", compute_hmac(secret, &signed))
}

/// `sha256=<hex>` over `timestamp.nonce.event_id.event_type.body`.
pub fn webhook_signature_v1(
    secret: &[u8],
    timestamp: i64,
    nonce: &str,
    event_id: &str,
    event_type: &str,
    body: &[u8],
) -> String {
    let prefix = format!("{timestamp}.{nonce}.{event_id}.{event_type}.");
    let mut signed = Vec::with_capacity(prefix.len() + body.len());
    signed.extend_from_slice(prefix.as_bytes());
    signed.extend_from_slice(body);
    format!("sha256={}", compute_hmac(secret, &signed))
}

/// Check a `sha256=<hex>` webhook signature header.
pub fn verify_webhook_signature(secret: &[u8], timestamp: i64, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let mut signed = Vec::with_capacity(body.len() + 24);
    signed.extend_from_slice(timestamp.to_string().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(body);
    verify_hmac(secret, &signed, hex_sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_roundtrip() {
        let secret = b"test-secret";
        let body = b"request body content";
        let sig = compute_hmac(secret, body);
        assert!(verify_hmac(secret, body, &sig));
    }

    #[test]
    fn test_hmac_wrong_secret() {
        let body = b"request body content";
        let sig = compute_hmac(b"secret-1", body);
        assert!(!verify_hmac(b"secret-2", body, &sig));
    }

    #[test]
    fn test_hmac_invalid_hex() {
        assert!(!verify_hmac(b"secret", b"body", "not-hex-zz"));
    }

    #[test]
    fn test_rfc4231_case_2() {
        let sig = compute_hmac(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_webhook_signature_covers_timestamp() {
        let body = br#"{"event_id":"evt_1"}"#;
        let header = webhook_signature(b"whsec", 1_700_000_000, body);
        assert!(header.starts_with("sha256="));
        assert!(verify_webhook_signature(b"whsec", 1_700_000_000, body, &header));
        assert!(!verify_webhook_signature(b"whsec", 1_700_000_001, body, &header));
        assert!(!verify_webhook_signature(b"other", 1_700_000_000, body, &header));
    }

    #[test]
    fn test_v1_signature_binds_event_identity() {
        let a = webhook_signature_v1(b"k", 1, "n", "evt_a", "t", b"{}");
        let b = webhook_signature_v1(b"k", 1, "n", "evt_b", "t", b"{}");
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_material_hash_trims_input() {
        assert_eq!(
            key_material_hash("secret", " tpubABC "),
            key_material_hash("secret", "tpubABC")
        );
    }
}

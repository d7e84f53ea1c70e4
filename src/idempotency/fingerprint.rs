use crate::error::ConfigError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic, keyed fingerprints of request content.
///
/// `hex(HMAC-SHA256(secret, body))`, 64 lowercase hex characters. The keyed
/// state is computed once and cloned per call.
#[derive(Clone)]
pub struct FingerprintGenerator {
    mac: HmacSha256,
}

impl FingerprintGenerator {
    /// Key the generator. An empty secret is rejected.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        // HMAC accepts keys of any length; this cannot fail for a non-empty key.
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| ConfigError::EmptySecret)?;
        Ok(Self { mac })
    }

    /// Fingerprint of `body` alone.
    pub fn generate_key(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Fingerprint of `context ":" body`, so equal bodies from different
    /// submitters do not collide.
    pub fn generate_key_with_context(&self, body: &[u8], context: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(context.as_bytes());
        mac.update(b":");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check a signature over `body` in constant time.
    ///
    /// Only the exact form [`generate_key`](Self::generate_key) produces is
    /// accepted: 64 lowercase hex characters. Uppercase hex is rejected.
    pub fn verify(&self, body: &[u8], signature_hex: &str) -> bool {
        if signature_hex.is_empty() || signature_hex.bytes().any(|b| b.is_ascii_uppercase()) {
            return false;
        }
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }
}

impl fmt::Debug for FingerprintGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintGenerator").field("secret", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2.
    const RFC_KEY: &str = "Jefe";
    const RFC_DATA: &[u8] = b"what do ya want for nothing?";
    const RFC_MAC: &str = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";

    #[test]
    fn matches_published_vector() {
        let keys = FingerprintGenerator::new(RFC_KEY).unwrap();
        assert_eq!(keys.generate_key(RFC_DATA), RFC_MAC);
    }

    #[test]
    fn context_is_joined_with_a_colon() {
        let keys = FingerprintGenerator::new(RFC_KEY).unwrap();
        assert_eq!(
            keys.generate_key_with_context(b"do ya want for nothing?", "what"),
            keys.generate_key(b"what:do ya want for nothing?")
        );
        assert_ne!(
            keys.generate_key_with_context(b"{}", "crew-1"),
            keys.generate_key_with_context(b"{}", "crew-2")
        );
    }

    #[test]
    fn output_is_lowercase_hex_and_sensitive_to_every_byte() {
        let keys = FingerprintGenerator::new("s3cret").unwrap();
        let a = keys.generate_key(b"{\"crew\":\"c1\",\"lat\":1.0}");
        let b = keys.generate_key(b"{\"crew\":\"c1\",\"lat\":1.1}");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_ne!(a, b);
        assert_eq!(a, keys.generate_key(b"{\"crew\":\"c1\",\"lat\":1.0}"));
    }

    #[test]
    fn verify_accepts_only_the_right_signature() {
        let keys = FingerprintGenerator::new(RFC_KEY).unwrap();
        assert!(keys.verify(RFC_DATA, RFC_MAC));
        assert!(!keys.verify(b"tampered", RFC_MAC));
        assert!(!keys.verify(RFC_DATA, "not-hex"));
    }

    #[test]
    fn verify_rejects_uppercase_empty_and_truncated_signatures() {
        let keys = FingerprintGenerator::new(RFC_KEY).unwrap();
        assert!(!keys.verify(RFC_DATA, &RFC_MAC.to_ascii_uppercase()));
        assert!(!keys.verify(RFC_DATA, ""));
        assert!(!keys.verify(RFC_DATA, &RFC_MAC[..62]));
        assert!(keys.verify(RFC_DATA, &keys.generate_key(RFC_DATA)));
    }

    #[test]
    fn empty_secret_is_rejected_and_debug_redacts() {
        assert_eq!(FingerprintGenerator::new("").unwrap_err(), ConfigError::EmptySecret);
        let keys = FingerprintGenerator::new("hunter2").unwrap();
        assert!(!format!("{keys:?}").contains("hunter2"));
    }
}

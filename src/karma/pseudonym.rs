//! Keyed hashing of user identifiers for the opt-out registry.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::ConfigError;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;

/// HMAC-SHA256 over the raw user id, hex encoded. The raw id never reaches
/// the opt-out table.
#[derive(Clone)]
pub struct Pseudonymizer {
    mac: HmacSha256,
}

impl Pseudonymizer {
    pub fn new(key: &[u8]) -> Result<Self, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::Invalid {
                key: "KARMA_HASH_KEY",
                reason: "key must not be empty".into(),
            });
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|e| ConfigError::Invalid {
            key: "KARMA_HASH_KEY",
            reason: format!("HMAC error: {}", e),
        })?;
        Ok(Self { mac })
    }

    pub fn pseudonym(&self, user_id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(user_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }
}

impl fmt::Debug for Pseudonymizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pseudonymizer { key: [REDACTED] }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_per_key_and_distinct_across_keys() {
        let a = Pseudonymizer::new(b"first key").unwrap();
        let b = Pseudonymizer::new(b"second key").unwrap();
        let id = "@alice:example.org";
        assert_eq!(a.pseudonym(id), a.pseudonym(id));
        assert_ne!(a.pseudonym(id), b.pseudonym(id));
        assert_ne!(a.pseudonym(id), a.pseudonym("@bob:example.org"));
    }

    #[test]
    fn output_is_hex_sha256_sized() {
        let p = Pseudonymizer::new(&Pseudonymizer::generate_key()).unwrap();
        let h = p.pseudonym("@alice:example.org");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!h.contains("alice"));
    }

    #[test]
    fn empty_key_rejected() {
        assert!(Pseudonymizer::new(b"").is_err());
    }

    #[test]
    fn debug_hides_key() {
        let p = Pseudonymizer::new(b"secret").unwrap();
        assert!(!format!("{:?}", p).contains("secret"));
    }
}

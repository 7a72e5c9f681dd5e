//! Session security tokens.
//!
//! A [`SecurityToken`] is an opaque, immutable credential: an identifier, a
//! validity interval, and zero or more symmetric keys. Identity is the
//! [`TokenId`] compared by value; the certificate-fingerprint comparison
//! survives only as the named legacy method
//! [`SecurityToken::matches_fingerprint`].

mod validity;

pub use validity::{effective_expiration, infinite_expiration, is_currently_valid};

use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Token identifier, compared by value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenId(String);

impl TokenId {
    /// Create a new token ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Symmetric key material (secret bytes)
#[derive(Clone)]
pub struct SymmetricKey {
    /// The raw key bytes
    bytes: Vec<u8>,
}

impl SymmetricKey {
    /// Create key material from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Key length in bits
    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't leak key material in debug output
        write!(f, "SymmetricKey([REDACTED, {} bytes])", self.bytes.len())
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        // Zeroize key material on drop
        for byte in &mut self.bytes {
            *byte = 0;
        }
    }
}

/// An issued session security token.
///
/// Immutable once constructed. Cloning shares nothing mutable; in practice
/// tokens are passed around as `Arc<SecurityToken>`.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    id: TokenId,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
    keys: Vec<SymmetricKey>,
    fingerprint: Option<String>,
}

impl SecurityToken {
    /// Create a new token
    pub fn new(
        id: TokenId,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        keys: Vec<SymmetricKey>,
    ) -> Self {
        Self {
            id,
            valid_from,
            valid_to,
            keys,
            fingerprint: None,
        }
    }

    /// Attach an issuer certificate fingerprint (hex)
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Token identifier
    pub fn id(&self) -> &TokenId {
        &self.id
    }

    /// Start of the validity interval
    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    /// End of the validity interval
    pub fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to
    }

    /// Symmetric keys carried by the token
    pub fn keys(&self) -> &[SymmetricKey] {
        &self.keys
    }

    /// The single session key, when the token carries exactly one.
    pub fn session_key(&self) -> Option<&SymmetricKey> {
        match self.keys.as_slice() {
            [key] => Some(key),
            _ => None,
        }
    }

    /// Issuer certificate fingerprint, if known
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Legacy acceptance check: compare issuer certificate fingerprints.
    ///
    /// Token identity is the [`TokenId`]; this fallback exists for peers
    /// that re-issue a token under a new ID but the same certificate. Both
    /// sides must carry a fingerprint for the comparison to succeed.
    pub fn matches_fingerprint(&self, other: &SecurityToken) -> bool {
        match (&self.fingerprint, &other.fingerprint) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Compute the hex SHA-256 fingerprint of certificate bytes
pub fn certificate_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Local policy for keys carried by issued tokens.
///
/// A negotiated token must carry exactly one symmetric key of an accepted
/// bit length; anything else is a security-policy failure.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    /// Accepted symmetric key sizes in bits
    accepted_bits: Vec<u16>,
}

impl KeyPolicy {
    /// Create a policy accepting the given key sizes (bits)
    pub fn new(accepted_bits: Vec<u16>) -> Self {
        Self { accepted_bits }
    }

    /// Accepted key sizes in bits
    pub fn accepted_bits(&self) -> &[u16] {
        &self.accepted_bits
    }

    /// Validate an issued token against this policy.
    pub fn validate(&self, token: &SecurityToken) -> Result<()> {
        let key = match token.keys() {
            [] => {
                return Err(Error::SecurityPolicy(format!(
                    "token {} carries no symmetric key",
                    token.id()
                )))
            },
            [key] => key,
            keys => {
                return Err(Error::SecurityPolicy(format!(
                    "token {} carries {} symmetric keys, expected exactly one",
                    token.id(),
                    keys.len()
                )))
            },
        };

        let bits = key.bit_len() as u16;
        if !self.accepted_bits.contains(&bits) {
            return Err(Error::SecurityPolicy(format!(
                "token {} key size {bits} bits not in accepted set {:?}",
                token.id(),
                self.accepted_bits
            )));
        }
        Ok(())
    }
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            accepted_bits: vec![128, 192, 256],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn token_with_keys(keys: Vec<SymmetricKey>) -> SecurityToken {
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        SecurityToken::new(TokenId::new("tok-1"), from, to, keys)
    }

    #[test]
    fn test_token_identity_is_by_id_value() {
        let a = token_with_keys(vec![SymmetricKey::new(vec![1u8; 32])]);
        let b = token_with_keys(vec![SymmetricKey::new(vec![2u8; 32])]);
        // Same ID value, different key material: same identity
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_fingerprint_fallback_requires_both_sides() {
        let a = token_with_keys(vec![]).with_fingerprint("ab12");
        let b = token_with_keys(vec![]).with_fingerprint("ab12");
        let c = token_with_keys(vec![]);

        assert!(a.matches_fingerprint(&b));
        assert!(!a.matches_fingerprint(&c));
        assert!(!c.matches_fingerprint(&a));
    }

    #[test]
    fn test_symmetric_key_debug_redacted() {
        let key = SymmetricKey::new(vec![0x41, 0x42, 0x43]);
        let debug = format!("{:?}", key);
        assert!(!debug.contains("ABC"));
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("3 bytes"));
    }

    #[test]
    fn test_key_policy_accepts_single_256_bit_key() {
        let policy = KeyPolicy::default();
        let token = token_with_keys(vec![SymmetricKey::new(vec![0u8; 32])]);
        assert!(policy.validate(&token).is_ok());
    }

    #[test]
    fn test_key_policy_rejects_zero_keys() {
        let policy = KeyPolicy::default();
        let token = token_with_keys(vec![]);
        let err = policy.validate(&token).unwrap_err();
        assert!(err.to_string().contains("no symmetric key"));
    }

    #[test]
    fn test_key_policy_rejects_multiple_keys() {
        let policy = KeyPolicy::default();
        let token = token_with_keys(vec![
            SymmetricKey::new(vec![0u8; 32]),
            SymmetricKey::new(vec![1u8; 32]),
        ]);
        let err = policy.validate(&token).unwrap_err();
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[test]
    fn test_key_policy_rejects_unsupported_length() {
        let policy = KeyPolicy::new(vec![256]);
        let token = token_with_keys(vec![SymmetricKey::new(vec![0u8; 20])]);
        let err = policy.validate(&token).unwrap_err();
        assert!(matches!(err, Error::SecurityPolicy(_)));
        assert!(err.to_string().contains("160"));
    }

    #[test]
    fn test_certificate_fingerprint_is_hex_sha256() {
        let fp = certificate_fingerprint(b"certificate-bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

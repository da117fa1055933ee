/*
    PayloadHash - content identity of network payloads

    Responsibilities:
    `hash.rs` defines the 256-bit identity every record is keyed by. Both mutable
    and immutable records are addressed by the hash of their canonical payload
    encoding, so the identity stays stable across re-broadcasts, refreshes and
    restarts.

    Inputs:
    - canonical payload bytes (hashed through a `ContentHasher`)
    - raw 32-byte digests read back from disk or the wire

    Outputs:
    - 256-bit identities, ordered and hashable
    - short hex rendering for logs
*/

use serde::{Deserialize, Serialize};
use std::fmt;

/// 256-bit content identity of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PayloadHash([u8; 32]);

impl PayloadHash {
    /// Wrap a raw 32-byte digest
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PayloadHash(bytes)
    }

    /// Parse a digest from a slice, rejecting anything that is not exactly 32 bytes
    pub fn try_from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = data.try_into().ok()?;
        Some(PayloadHash(bytes))
    }

    /// Blake3 digest of arbitrary data
    pub fn digest(data: &[u8]) -> Self {
        PayloadHash(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Full lowercase hex form, used by the CLI
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Stripe index for lock sharding
    pub fn stripe(&self, stripes: usize) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        (u64::from_le_bytes(prefix) % stripes.max(1) as u64) as usize
    }

    #[cfg(test)]
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        PayloadHash(bytes)
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Display first 8 bytes as hex for readability
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for PayloadHash {
    fn from(bytes: [u8; 32]) -> Self {
        PayloadHash(bytes)
    }
}

impl AsRef<[u8]> for PayloadHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = PayloadHash::digest(b"offer-1");
        let b = PayloadHash::digest(b"offer-1");
        let c = PayloadHash::digest(b"offer-2");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_try_from_slice_rejects_wrong_length() {
        assert!(PayloadHash::try_from_slice(&[0u8; 31]).is_none());
        assert!(PayloadHash::try_from_slice(&[0u8; 33]).is_none());

        let hash = PayloadHash::try_from_slice(&[7u8; 32]).unwrap();
        assert_eq!(hash.as_bytes(), &[7u8; 32]);
    }

    #[test]
    fn test_display_is_short_hex() {
        let hash = PayloadHash::from_bytes([0xab; 32]);
        assert_eq!(hash.to_string(), "abababababababab");
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_stripe_stays_in_range() {
        for _ in 0..100 {
            let hash = PayloadHash::random();
            assert!(hash.stripe(64) < 64);
        }
        assert_eq!(PayloadHash::random().stripe(0), 0);
    }
}

//! Signing, verification and content hashing capabilities
//!
//! The store only ever talks to the `RecordSigner`, `SignatureVerifier` and
//! `ContentHasher` traits. The default implementations use Ed25519
//! (ed25519-dalek) and Blake3.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use thiserror::Error;

use super::model::hash::PayloadHash;
use super::model::record::OwnerKey;

/// Why a signature did not verify
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("malformed public key ({0} bytes)")]
    MalformedKey(usize),

    #[error("malformed signature ({0} bytes)")]
    MalformedSignature(usize),

    #[error("signature does not match")]
    Mismatch,
}

/// Produces owner signatures for local publication
pub trait RecordSigner: Send + Sync {
    fn public_key(&self) -> OwnerKey;
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Checks owner signatures on inbound mutations
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        message: &[u8],
        signature: &[u8],
        public_key: &OwnerKey,
    ) -> Result<(), VerifyError>;
}

/// Maps canonical payload bytes to an identity
pub trait ContentHasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> PayloadHash;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash(&self, data: &[u8]) -> PayloadHash {
        PayloadHash::digest(data)
    }
}

/// Ed25519 key held by a node that publishes records
#[derive(Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut seed = [0u8; 32];
        rand::rng().fill(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key().to_string())
            .finish()
    }
}

impl RecordSigner for Ed25519Signer {
    fn public_key(&self) -> OwnerKey {
        OwnerKey(self.signing_key.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        message: &[u8],
        signature: &[u8],
        public_key: &OwnerKey,
    ) -> Result<(), VerifyError> {
        let key_bytes: &[u8; 32] = public_key
            .as_bytes()
            .try_into()
            .map_err(|_| VerifyError::MalformedKey(public_key.as_bytes().len()))?;
        let verifying_key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|_| VerifyError::MalformedKey(key_bytes.len()))?;

        let signature = Signature::from_slice(signature)
            .map_err(|_| VerifyError::MalformedSignature(signature.len()))?;

        verifying_key.verify(message, &signature).map_err(|_| VerifyError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign(b"hello");

        let verifier = Ed25519Verifier;
        assert_eq!(verifier.verify(b"hello", &sig, &signer.public_key()), Ok(()));
        assert_eq!(
            verifier.verify(b"tampered", &sig, &signer.public_key()),
            Err(VerifyError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_key_is_mismatch() {
        let alice = Ed25519Signer::generate();
        let bob = Ed25519Signer::generate();
        let sig = alice.sign(b"msg");

        assert_eq!(
            Ed25519Verifier.verify(b"msg", &sig, &bob.public_key()),
            Err(VerifyError::Mismatch)
        );
    }

    #[test]
    fn test_malformed_inputs() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign(b"msg");

        assert_eq!(
            Ed25519Verifier.verify(b"msg", &sig, &OwnerKey(vec![0u8; 16])),
            Err(VerifyError::MalformedKey(16))
        );
        assert_eq!(
            Ed25519Verifier.verify(b"msg", &sig[..10], &signer.public_key()),
            Err(VerifyError::MalformedSignature(10))
        );
    }

    #[test]
    fn test_seed_round_trip() {
        let signer = Ed25519Signer::generate();
        let restored = Ed25519Signer::from_seed(signer.seed());
        assert_eq!(signer.public_key(), restored.public_key());
    }
}

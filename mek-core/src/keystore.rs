//! Attestation signing for sealed evidence.
//!
//! The kernel signs exactly one thing: the 32-byte `hash_chain_root` of a
//! sealed bundle. The [`AttestationSigner`] trait is deliberately that
//! narrow; there is no general-purpose sign-anything surface, so key misuse
//! for other payloads is a type error. Hardware-backed signers can be slotted
//! in behind the trait without touching the evidence subsystem.
//!
//! Only the in-memory Ed25519 signer ships here. The kernel keeps no
//! persistent key material; each instance generates a fresh keypair unless
//! seeded explicitly.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to sign root: {0}")]
    SigningFailed(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;

/// Signs sealed chain roots and nothing else.
///
/// Implementations must be thread-safe and deterministic for a fixed key:
/// the chain over a bundle is deterministic, so the attestation over it is
/// too.
pub trait AttestationSigner: Send + Sync {
    /// Sign a sealed chain root. Ed25519 backends return 64 bytes.
    fn sign_root(&self, root: &[u8; 32]) -> Result<Vec<u8>>;

    /// Verify a root signature against this signer's own public key.
    fn verify_root(&self, root: &[u8; 32], signature: &[u8]) -> Result<()>;

    /// The public key bytes (32 bytes for Ed25519).
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Short fingerprint for logs: scheme tag and leading public-key bytes.
    fn key_id(&self) -> String {
        format!("attester:{}", hex::encode(&self.public_key_bytes()[..4]))
    }
}

/// In-memory Ed25519 attestation signer.
#[derive(Clone)]
pub struct Ed25519Attester {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Attester {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Ok(Ed25519Attester {
            signing_key,
            verifying_key,
        })
    }

    /// Rebuild a keypair from a 32-byte seed. The caller's seed array is
    /// zeroized in place before this returns; only the signer retains key
    /// material afterwards.
    pub fn from_seed(seed: &mut [u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        seed.zeroize();
        Ok(Ed25519Attester {
            signing_key,
            verifying_key,
        })
    }
}

impl AttestationSigner for Ed25519Attester {
    fn sign_root(&self, root: &[u8; 32]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(root).to_bytes().to_vec())
    }

    fn verify_root(&self, root: &[u8; 32], signature: &[u8]) -> Result<()> {
        let sig = Signature::from_slice(signature)
            .map_err(|e| KeyStoreError::InvalidKey(e.to_string()))?;
        self.verifying_key
            .verify(root, &sig)
            .map_err(|_| KeyStoreError::InvalidSignature)?;
        Ok(())
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_bytes().to_vec()
    }

    fn key_id(&self) -> String {
        format!("ed25519:{}", hex::encode(&self.verifying_key.to_bytes()[..4]))
    }
}

/// Verify a detached root signature with a bare public key, without a
/// signer. Used by evidence verification, which must never need the signing
/// key.
pub fn verify_detached(public_key: &[u8], root: &[u8; 32], signature: &[u8]) -> Result<()> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| KeyStoreError::InvalidKey("public key must be 32 bytes".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| KeyStoreError::InvalidKey(e.to_string()))?;
    let sig =
        Signature::from_slice(signature).map_err(|e| KeyStoreError::InvalidKey(e.to_string()))?;
    verifying_key
        .verify(root, &sig)
        .map_err(|_| KeyStoreError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::hash_bytes;

    fn sample_root() -> [u8; 32] {
        *hash_bytes(b"sealed bundle contents").as_bytes()
    }

    #[test]
    fn test_generate_and_sign_root() {
        let attester = Ed25519Attester::generate().unwrap();
        let root = sample_root();
        let sig = attester.sign_root(&root).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(attester.verify_root(&root, &sig).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_root() {
        let attester = Ed25519Attester::generate().unwrap();
        let sig = attester.sign_root(&sample_root()).unwrap();
        let other = *hash_bytes(b"different bundle").as_bytes();
        assert!(matches!(
            attester.verify_root(&other, &sig),
            Err(KeyStoreError::InvalidSignature)
        ));
    }

    #[test]
    fn test_verify_rejects_tampered_signature() {
        let attester = Ed25519Attester::generate().unwrap();
        let root = sample_root();
        let mut sig = attester.sign_root(&root).unwrap();
        sig[0] ^= 0xFF;
        assert!(attester.verify_root(&root, &sig).is_err());
    }

    #[test]
    fn test_from_seed_deterministic_and_scrubbed() {
        let mut seed_a = [7u8; 32];
        let mut seed_b = [7u8; 32];
        let a = Ed25519Attester::from_seed(&mut seed_a).unwrap();
        let b = Ed25519Attester::from_seed(&mut seed_b).unwrap();

        // Caller's seed arrays are gone the moment the signer exists
        assert_eq!(seed_a, [0u8; 32]);
        assert_eq!(seed_b, [0u8; 32]);

        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        let root = sample_root();
        assert_eq!(a.sign_root(&root).unwrap(), b.sign_root(&root).unwrap());
    }

    #[test]
    fn test_detached_verification() {
        let attester = Ed25519Attester::generate().unwrap();
        let root = sample_root();
        let sig = attester.sign_root(&root).unwrap();
        assert!(verify_detached(&attester.public_key_bytes(), &root, &sig).is_ok());

        let other = *hash_bytes(b"not that root").as_bytes();
        assert!(verify_detached(&attester.public_key_bytes(), &other, &sig).is_err());
    }

    #[test]
    fn test_detached_rejects_short_key() {
        assert!(matches!(
            verify_detached(&[1u8; 5], &sample_root(), &[0u8; 64]),
            Err(KeyStoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_key_id_names_scheme_and_fingerprint() {
        let attester = Ed25519Attester::generate().unwrap();
        let id = attester.key_id();
        assert!(id.starts_with("ed25519:"));
        assert_eq!(id.len(), "ed25519:".len() + 8);
    }
}

//! Keypairs and key derivations
//!
//! All derivations use BLAKE3 in key-derivation mode with a fixed context
//! string per purpose, so the same seed never yields related keys across
//! purposes.

use crate::error::{Error, Result};
use crate::types::{Bytes32, PublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

// =============================================================================
// DERIVATION CONTEXTS
// =============================================================================

/// Context for identity keypairs derived from a primary seed
pub const CONTEXT_IDENTITY: &str = "slashtag 2022-10-01 identity keypair";
/// Context for named log keypairs derived from a primary seed
pub const CONTEXT_CORE: &str = "slashtag 2022-10-01 core keypair";
/// Context for discovery keys (announce interest without revealing the key)
pub const CONTEXT_DISCOVERY: &str = "slashtag 2022-10-01 discovery key";
/// Domain prefix for block signatures
pub const DOMAIN_BLOCK: &[u8] = b"slashtag-block";

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic derivation and testing)
    pub fn from_seed(seed: &Bytes32) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Get the secret seed
    pub fn seed(&self) -> Bytes32 {
        self.signing_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(public_key.as_bytes()).map_err(|_| Error::InvalidSignature)?;
        let signature: [u8; 64] = signature.try_into().map_err(|_| Error::InvalidSignature)?;
        verifying_key
            .verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Generate a fresh random primary seed.
pub fn random_seed() -> Bytes32 {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
}

fn derive_seed(context: &str, primary_seed: &Bytes32, name: &str) -> Bytes32 {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(primary_seed);
    hasher.update(name.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Derive the identity keypair for `name` under a primary seed.
pub fn derive_identity_keypair(primary_seed: &Bytes32, name: &str) -> KeyPair {
    KeyPair::from_seed(&derive_seed(CONTEXT_IDENTITY, primary_seed, name))
}

/// Derive the keypair of the named log under a primary seed.
pub fn derive_core_keypair(primary_seed: &Bytes32, name: &str) -> KeyPair {
    KeyPair::from_seed(&derive_seed(CONTEXT_CORE, primary_seed, name))
}

/// Derive the discovery key for a log key.
pub fn discovery_key(key: &PublicKey) -> Bytes32 {
    blake3::derive_key(CONTEXT_DISCOVERY, key.as_bytes())
}

/// Compute the bytes signed for block `index` of the log `key`.
///
/// `sign_bytes = "slashtag-block" || key || index_le || BLAKE3(data)`
pub fn block_sign_bytes(key: &PublicKey, index: u64, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_BLOCK.len() + 32 + 8 + 32);
    bytes.extend_from_slice(DOMAIN_BLOCK);
    bytes.extend_from_slice(key.as_bytes());
    bytes.extend_from_slice(&index.to_le_bytes());
    bytes.extend_from_slice(blake3::hash(data).as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert!(KeyPair::verify(&kp.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let seed = [9u8; 32];
        let a = derive_identity_keypair(&seed, "alice");
        let b = derive_identity_keypair(&seed, "alice");
        assert_eq!(a.public_key(), b.public_key());

        let other = derive_identity_keypair(&seed, "bob");
        assert_ne!(a.public_key(), other.public_key());
    }

    #[test]
    fn test_contexts_are_separated() {
        let seed = [9u8; 32];
        let identity = derive_identity_keypair(&seed, "foo");
        let core = derive_core_keypair(&seed, "foo");
        assert_ne!(identity.public_key(), core.public_key());
    }

    #[test]
    fn test_discovery_key_hides_key() {
        let key = KeyPair::generate().public_key();
        assert_ne!(&discovery_key(&key), key.as_bytes());
        assert_eq!(discovery_key(&key), discovery_key(&key));
    }

    #[test]
    fn test_block_signature_binds_index() {
        let kp = KeyPair::generate();
        let key = kp.public_key();
        let sig = kp.sign(&block_sign_bytes(&key, 0, b"hello"));

        assert!(KeyPair::verify(&key, &block_sign_bytes(&key, 0, b"hello"), &sig).is_ok());
        assert!(KeyPair::verify(&key, &block_sign_bytes(&key, 1, b"hello"), &sig).is_err());
    }
}

//! Ed25519 signing and the generation-hash chain.
//!
//! Entity hashes use BLAKE3; the generation hash chain uses SHA-256 so the
//! two hash domains can never collide.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::types::{Hash256, PublicKey};

/// An Ed25519 key pair used for harvesting and transaction signing.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Derive a key pair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// The public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature over `message`.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let verifying = VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying
        .verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Compute the next link of the generation-hash chain:
/// `SHA-256(parent_generation_hash || signer_public_key)`.
///
/// The harvester's eligibility hit derives from this value, so it must not
/// be forgeable independently of the parent block.
pub fn generation_hash(parent: &Hash256, signer: &PublicKey) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(signer.as_bytes());
    Hash256(hasher.finalize().into())
}

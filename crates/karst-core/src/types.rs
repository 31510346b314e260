//! Core protocol types: hashes, keys, transactions, blocks.
//!
//! All amounts are in microkarst (1 KST = 10^6 microkarst). Heights and
//! network timestamps (milliseconds) use u64 per protocol convention.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CryptoError;

/// A 32-byte hash value.
///
/// Used for entity hashes (BLAKE3), generation hashes (SHA-256), and
/// merkle roots (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Also the "disabled" state hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 32-byte Ed25519 public key identifying an account.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// The zero key, used as the nemesis signer.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form for logs; full keys are only needed on the wire.
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

/// Direction of a mosaic supply change.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum SupplyChangeDirection {
    /// Mint additional supply to the owner.
    Increase,
    /// Burn supply held by the owner.
    Decrease,
}

/// The declarative payload of a transaction.
///
/// Transactions are not programs; each body names a fixed state transition
/// that the matching plugin validates and applies.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum TransactionBody {
    /// Move `amount` from the signer to `recipient`.
    Transfer { recipient: PublicKey, amount: u64 },
    /// Lock `amount` of the signer's balance against a future aggregate
    /// with entity hash `lock_hash`, expiring `duration` blocks ahead.
    HashLock { lock_hash: Hash256, amount: u64, duration: u64 },
    /// A bonded aggregate: a batch of transfers whose entity hash must be
    /// covered by an active, unused hash lock.
    AggregateBonded { transfers: Vec<(PublicKey, u64)> },
    /// Mint or burn supply of a mosaic owned by the signer.
    MosaicSupplyChange { mosaic_id: u64, direction: SupplyChangeDirection, delta: u64 },
    /// Claim a namespace for `duration` blocks.
    RegisterNamespace { namespace_id: u64, duration: u64 },
    /// Lock `amount` for `recipient`, released by proof of `secret`.
    SecretLock { secret: Hash256, recipient: PublicKey, amount: u64, duration: u64 },
    /// Release a secret lock by revealing the preimage of `secret`.
    SecretProof { secret: Hash256, proof: Vec<u8> },
}

impl TransactionBody {
    /// Short name of the body kind, for logging and plugin dispatch.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "transfer",
            Self::HashLock { .. } => "hash_lock",
            Self::AggregateBonded { .. } => "aggregate_bonded",
            Self::MosaicSupplyChange { .. } => "mosaic_supply_change",
            Self::RegisterNamespace { .. } => "register_namespace",
            Self::SecretLock { .. } => "secret_lock",
            Self::SecretProof { .. } => "secret_proof",
        }
    }
}

/// A signed transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Account that signed and pays for this transaction.
    pub signer: PublicKey,
    /// Network timestamp (ms) after which this transaction is invalid.
    pub deadline: u64,
    /// Maximum fee the signer is willing to pay, in microkarst.
    pub max_fee: u64,
    /// The declarative payload.
    pub body: TransactionBody,
    /// Ed25519 signature (64 bytes) over the unsigned encoding.
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Canonical unsigned encoding: everything except the signature.
    ///
    /// Uses bincode with standard config for deterministic serialization.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let unsigned = (&self.signer, self.deadline, self.max_fee, &self.body);
        bincode::encode_to_vec(unsigned, bincode::config::standard())
            .map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// Compute the entity hash (BLAKE3 over the unsigned encoding).
    pub fn entity_hash(&self) -> Result<Hash256, CryptoError> {
        Ok(Hash256(blake3::hash(&self.unsigned_bytes()?).into()))
    }
}

/// A complete block.
///
/// `state_hash` commits to the contents of every state cache *after* this
/// block's transactions have been executed, and `transactions_hash` is the
/// merkle root over the contained transaction entity hashes. Both are
/// covered by the block signature.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Height of this block. Genesis has height 1.
    pub height: u64,
    /// Network timestamp in milliseconds.
    pub timestamp: u64,
    /// Entity hash of the parent block.
    pub previous_hash: Hash256,
    /// Merkle root over all state caches after executing this block.
    pub state_hash: Hash256,
    /// Merkle root over transaction entity hashes.
    pub transactions_hash: Hash256,
    /// Difficulty this block was forged at.
    pub difficulty: u64,
    /// Public key of the harvesting account.
    pub signer: PublicKey,
    /// Ed25519 signature (64 bytes) over the header encoding.
    pub signature: Vec<u8>,
    /// Ordered transactions.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Header size in bytes when serialized for hashing and signing.
    const HEADER_SIZE: usize = 3 * 8 + 4 * 32;

    /// Canonical header encoding: fixed byte layout, little-endian, with
    /// all hash commitments but without the signature or transactions.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(Self::HEADER_SIZE);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(self.previous_hash.as_bytes());
        data.extend_from_slice(self.state_hash.as_bytes());
        data.extend_from_slice(self.transactions_hash.as_bytes());
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(self.signer.as_bytes());
        data
    }

    /// Compute the block's entity hash (BLAKE3 over the header encoding).
    pub fn entity_hash(&self) -> Hash256 {
        Hash256(blake3::hash(&self.header_bytes()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            signer: PublicKey([0x11; 32]),
            deadline: 5_000,
            max_fee: 100,
            body: TransactionBody::Transfer {
                recipient: PublicKey([0x22; 32]),
                amount: 1_000_000,
            },
            signature: vec![0u8; 64],
        }
    }

    fn sample_block() -> Block {
        Block {
            height: 2,
            timestamp: 60_000,
            previous_hash: Hash256([0xAA; 32]),
            state_hash: Hash256::ZERO,
            transactions_hash: Hash256::ZERO,
            difficulty: 100_000,
            signer: PublicKey([0x33; 32]),
            signature: vec![0u8; 64],
            transactions: vec![],
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_zero_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert_eq!(Hash256::ZERO, Hash256::default());
    }

    #[test]
    fn hash256_nonzero_is_not_zero() {
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(&s[0..2], "ab");
    }

    #[test]
    fn hash256_ordering_is_bytewise() {
        let lo = Hash256([0x01; 32]);
        let hi = Hash256([0x02; 32]);
        assert!(lo < hi);
    }

    // --- PublicKey ---

    #[test]
    fn public_key_display_abbreviated() {
        let s = format!("{}", PublicKey([0xCD; 32]));
        assert_eq!(s, "cdcdcdcd..");
    }

    // --- Transaction ---

    #[test]
    fn entity_hash_deterministic() {
        let tx = sample_tx();
        assert_eq!(tx.entity_hash().unwrap(), tx.entity_hash().unwrap());
    }

    #[test]
    fn entity_hash_changes_with_body() {
        let tx1 = sample_tx();
        let mut tx2 = sample_tx();
        tx2.max_fee = 200;
        assert_ne!(tx1.entity_hash().unwrap(), tx2.entity_hash().unwrap());
    }

    #[test]
    fn entity_hash_ignores_signature() {
        let tx1 = sample_tx();
        let mut tx2 = sample_tx();
        tx2.signature = vec![0xFF; 64];
        assert_eq!(tx1.entity_hash().unwrap(), tx2.entity_hash().unwrap());
    }

    #[test]
    fn body_kinds_are_distinct() {
        let bodies = [
            TransactionBody::Transfer { recipient: PublicKey::ZERO, amount: 0 },
            TransactionBody::HashLock { lock_hash: Hash256::ZERO, amount: 0, duration: 0 },
            TransactionBody::AggregateBonded { transfers: vec![] },
            TransactionBody::MosaicSupplyChange {
                mosaic_id: 0,
                direction: SupplyChangeDirection::Increase,
                delta: 0,
            },
            TransactionBody::RegisterNamespace { namespace_id: 0, duration: 0 },
            TransactionBody::SecretLock {
                secret: Hash256::ZERO,
                recipient: PublicKey::ZERO,
                amount: 0,
                duration: 0,
            },
            TransactionBody::SecretProof { secret: Hash256::ZERO, proof: vec![] },
        ];
        let kinds: std::collections::HashSet<_> = bodies.iter().map(|b| b.kind()).collect();
        assert_eq!(kinds.len(), bodies.len());
    }

    // --- Block ---

    #[test]
    fn block_entity_hash_deterministic() {
        let b = sample_block();
        assert_eq!(b.entity_hash(), b.entity_hash());
    }

    #[test]
    fn block_entity_hash_changes_with_height() {
        let b1 = sample_block();
        let mut b2 = sample_block();
        b2.height = 3;
        assert_ne!(b1.entity_hash(), b2.entity_hash());
    }

    #[test]
    fn block_entity_hash_covers_state_hash() {
        let b1 = sample_block();
        let mut b2 = sample_block();
        b2.state_hash = Hash256([0x01; 32]);
        assert_ne!(b1.entity_hash(), b2.entity_hash());
    }

    #[test]
    fn block_entity_hash_ignores_signature() {
        let b1 = sample_block();
        let mut b2 = sample_block();
        b2.signature = vec![0xFF; 64];
        assert_eq!(b1.entity_hash(), b2.entity_hash());
    }

    #[test]
    fn header_bytes_fixed_size() {
        assert_eq!(sample_block().header_bytes().len(), Block::HEADER_SIZE);
    }

    // --- Bincode round-trips ---

    #[test]
    fn bincode_round_trip_transaction() {
        let tx = sample_tx();
        let encoded = bincode::encode_to_vec(&tx, bincode::config::standard()).unwrap();
        let (decoded, _): (Transaction, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn bincode_round_trip_block() {
        let block = Block {
            transactions: vec![sample_tx()],
            ..sample_block()
        };
        let encoded = bincode::encode_to_vec(&block, bincode::config::standard()).unwrap();
        let (decoded, _): (Block, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(block, decoded);
    }
}

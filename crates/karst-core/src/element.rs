//! Block and transaction elements: entities plus their derived hashes.
//!
//! Elements are constructed once when an entity enters the pipeline and are
//! never mutated afterward, so every later stage sees identical artifacts.

use crate::crypto::generation_hash;
use crate::error::CryptoError;
use crate::merkle;
use crate::types::{Block, Hash256, Transaction};

/// A transaction together with its derived hashes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionElement {
    pub transaction: Transaction,
    /// BLAKE3 hash of the unsigned transaction encoding.
    pub entity_hash: Hash256,
    /// The hash this transaction contributes to the block's merkle root.
    /// Equal to the entity hash for all plain transaction kinds.
    pub merkle_component_hash: Hash256,
}

/// A transaction lifted out of a block or the unconfirmed cache, with the
/// hashes needed to track it independently of its container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    pub transaction: Transaction,
    pub entity_hash: Hash256,
    pub merkle_component_hash: Hash256,
}

impl TransactionInfo {
    /// Build an info record from a raw transaction.
    pub fn from_transaction(transaction: Transaction) -> Result<Self, CryptoError> {
        let entity_hash = transaction.entity_hash()?;
        Ok(Self { transaction, entity_hash, merkle_component_hash: entity_hash })
    }
}

/// A block together with its derived artifacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockElement {
    pub block: Block,
    /// BLAKE3 hash of the block header encoding.
    pub entity_hash: Hash256,
    /// Link in the generation-hash chain seeding harvester eligibility.
    pub generation_hash: Hash256,
    /// One element per contained transaction, in block order.
    pub transactions: Vec<TransactionElement>,
}

impl BlockElement {
    /// Derive all artifacts for `block` given the parent's generation hash.
    pub fn compute(block: Block, parent_generation_hash: &Hash256) -> Result<Self, CryptoError> {
        let entity_hash = block.entity_hash();
        let generation = generation_hash(parent_generation_hash, &block.signer);

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let tx_hash = tx.entity_hash()?;
            transactions.push(TransactionElement {
                transaction: tx.clone(),
                entity_hash: tx_hash,
                merkle_component_hash: tx_hash,
            });
        }

        Ok(Self { block, entity_hash, generation_hash: generation, transactions })
    }

    /// Merkle root over the contained transactions' merkle component hashes.
    pub fn transactions_merkle_root(&self) -> Hash256 {
        let leaves: Vec<Hash256> =
            self.transactions.iter().map(|t| t.merkle_component_hash).collect();
        merkle::merkle_root(&leaves)
    }
}

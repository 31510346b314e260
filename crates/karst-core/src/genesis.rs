//! The genesis block and seed accounts.
//!
//! Every network starts from the same height-1 block signed by the nemesis
//! key. Seed accounts receive their balances when the cache set is
//! initialized, before any further block is executed.

use crate::crypto::KeyPair;
use crate::types::{Block, Hash256, PublicKey};

/// Network timestamp of the genesis block, in milliseconds.
pub const GENESIS_TIMESTAMP: u64 = 1_640_995_200_000;

/// Difficulty assigned to the genesis block and used as the floor for the
/// difficulty calculation.
pub const GENESIS_DIFFICULTY: u64 = 100_000;

/// Balance granted to each seed account, in microkarst.
pub const SEED_ACCOUNT_BALANCE: u64 = 1_000_000_000_000;

/// Number of deterministic seed accounts funded at genesis.
pub const SEED_ACCOUNT_COUNT: u8 = 16;

/// The nemesis signing key. Publicly known; it can only ever sign height 1.
pub fn nemesis_key() -> KeyPair {
    KeyPair::from_seed([0x4B; 32])
}

/// Deterministic seed key pair `index` (0-based).
pub fn seed_key(index: u8) -> KeyPair {
    let mut seed = [0xA0u8; 32];
    seed[31] = index;
    KeyPair::from_seed(seed)
}

/// The seed accounts funded at genesis, in funding order.
pub fn seed_accounts() -> Vec<(PublicKey, u64)> {
    (0..SEED_ACCOUNT_COUNT)
        .map(|i| (seed_key(i).public_key(), SEED_ACCOUNT_BALANCE))
        .collect()
}

/// Build the genesis block.
///
/// The genesis state hash is zero by definition; state-hash verification
/// starts at height 2, after the seed accounts are installed.
pub fn genesis_block() -> Block {
    let nemesis = nemesis_key();
    let mut block = Block {
        height: 1,
        timestamp: GENESIS_TIMESTAMP,
        previous_hash: Hash256::ZERO,
        state_hash: Hash256::ZERO,
        transactions_hash: Hash256::ZERO,
        difficulty: GENESIS_DIFFICULTY,
        signer: nemesis.public_key(),
        signature: vec![],
        transactions: vec![],
    };
    block.signature = nemesis.sign(&block.header_bytes());
    block
}

/// Entity hash of the genesis block.
pub fn genesis_hash() -> Hash256 {
    genesis_block().entity_hash()
}

/// The first link of the generation-hash chain.
///
/// Seeded from the genesis entity hash and the nemesis signer.
pub fn genesis_generation_hash() -> Hash256 {
    crate::crypto::generation_hash(&genesis_hash(), &nemesis_key().public_key())
}

//! The harvester: forge a signed candidate block on top of the local tip.
//!
//! Eligibility is proof-of-stake: each unlocked key derives a *hit* from
//! the would-be generation hash and competes against a *target* that grows
//! with elapsed time and the account's importance and shrinks with
//! difficulty. The lowest eligible hit forges.

use std::sync::Arc;

use tracing::debug;

use karst_cache::{CacheSet, StateRead};
use karst_core::chain_config::ChainConfig;
use karst_core::crypto::{generation_hash, KeyPair};
use karst_core::element::BlockElement;
use karst_core::merkle;
use karst_core::types::{Block, Hash256};
use karst_core::ut_cache::UtCache;

use crate::difficulty::next_difficulty;
use crate::executor::{apply_transaction, pruning_boundary};
use crate::plugins::PluginRegistry;

/// Scale factor tuning average block production to the target interval for
/// seed-sized stakes at the genesis difficulty.
const TARGET_SCALE: u128 = 1 << 26;

/// The proof-of-stake target for a key at `elapsed_ms` past the parent.
fn hit_target(elapsed_ms: u64, importance: u64, difficulty: u64) -> u128 {
    (elapsed_ms as u128)
        .saturating_mul(importance as u128)
        .saturating_mul(TARGET_SCALE)
        / difficulty.max(1) as u128
}

/// The hit value a key would produce on top of `parent_generation_hash`.
fn hit_value(parent_generation_hash: &Hash256, signer: &karst_core::types::PublicKey) -> u64 {
    let gen = generation_hash(parent_generation_hash, signer);
    u64::from_le_bytes(gen.as_bytes()[0..8].try_into().expect("hash is 32 bytes"))
}

pub struct Harvester {
    keys: Vec<KeyPair>,
    config: ChainConfig,
    caches: Arc<CacheSet>,
    ut_cache: Arc<UtCache>,
    registry: Arc<PluginRegistry>,
}

impl Harvester {
    pub fn new(
        keys: Vec<KeyPair>,
        config: ChainConfig,
        caches: Arc<CacheSet>,
        ut_cache: Arc<UtCache>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self { keys, config, caches, ut_cache, registry }
    }

    /// Try to forge a block on top of `parent` at network time `now_ms`.
    ///
    /// `difficulty_samples` are the `(timestamp, difficulty)` pairs of the
    /// trailing difficulty window ending at the parent. Returns `None` when
    /// no unlocked key is eligible this round.
    pub fn harvest(
        &self,
        parent: &BlockElement,
        now_ms: u64,
        difficulty_samples: &[(u64, u64)],
    ) -> Option<Block> {
        if now_ms <= parent.block.timestamp {
            return None;
        }
        let elapsed_ms = now_ms - parent.block.timestamp;
        let next_height = parent.block.height + 1;
        let difficulty = next_difficulty(difficulty_samples, &self.config);
        let group_height = self.config.importance_group_height(parent.block.height);

        let view = self.caches.create_view();
        let mut best: Option<(u64, &KeyPair)> = None;
        for key in &self.keys {
            let public_key = key.public_key();
            let importance = view
                .account(&public_key)
                .map(|account| account.importance_at(group_height))
                .unwrap_or(0);
            if importance == 0 {
                continue;
            }
            let hit = hit_value(&parent.generation_hash, &public_key);
            if (hit as u128) >= hit_target(elapsed_ms, importance, difficulty) {
                continue;
            }
            if best.map(|(best_hit, _)| hit < best_hit).unwrap_or(true) {
                best = Some((hit, key));
            }
        }
        let (_, key) = best?;
        let signer = key.public_key();

        // Execute candidates speculatively; a failing candidate is skipped
        // by discarding its trial overlay.
        let mut delta = self.caches.create_detached_delta();
        let mut included = Vec::new();
        for info in self.ut_cache.candidates(self.config.max_transactions_per_block) {
            let mut trial = (*delta).clone();
            match apply_transaction(
                &self.registry,
                &mut trial,
                &info.transaction,
                &info.entity_hash,
                &signer,
                next_height,
            ) {
                Ok(()) => {
                    *delta = trial;
                    included.push(info);
                }
                Err(failure) => {
                    debug!(hash = %info.entity_hash, %failure, "skipping candidate transaction");
                }
            }
        }

        if self.config.importance_grouping > 0 && next_height % self.config.importance_grouping == 0
        {
            delta.record_importances(next_height);
        }
        if let Some(boundary) = pruning_boundary(next_height, &self.config) {
            delta.prune(boundary);
        }
        let state_hash = delta.state_hash();

        let tx_hashes: Vec<Hash256> = included.iter().map(|i| i.merkle_component_hash).collect();
        let mut block = Block {
            height: next_height,
            timestamp: now_ms,
            previous_hash: parent.entity_hash,
            state_hash,
            transactions_hash: merkle::merkle_root(&tx_hashes),
            difficulty,
            signer,
            signature: vec![],
            transactions: included.into_iter().map(|i| i.transaction).collect(),
        };
        block.signature = key.sign(&block.header_bytes());
        Some(block)
    }
}

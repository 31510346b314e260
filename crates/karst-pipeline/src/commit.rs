//! The commit stage: the pipeline's single writer.
//!
//! Every range is first evaluated to completion on a detached delta
//! (including any rewind), so the authoritative caches are mutated only
//! for ranges that are fully valid and win chain selection. A failure
//! during the authoritative replay therefore indicates divergence between
//! two executions of identical inputs and is fatal.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use karst_cache::{BlockStorage, CacheSet, StateRead};
use karst_consensus::difficulty::next_difficulty;
use karst_consensus::executor::{check_chain_link, execute_block, pruning_boundary};
use karst_consensus::plugins::PluginRegistry;
use karst_consensus::score::{is_better_chain, score_between, ChainScore, ScoreTracker};
use karst_core::chain_config::ChainConfig;
use karst_core::element::{BlockElement, TransactionInfo};
use karst_core::error::{KarstError, ValidationFailure, ValidationResult};
use karst_core::types::Hash256;
use karst_core::ut_cache::UtCache;

use crate::input::{AbortReason, CompletionStatus};

/// Fan-out sink invoked once per committed block element.
pub type NewBlockSink = Arc<dyn Fn(&BlockElement) + Send + Sync>;
/// Fan-out sink invoked once per admitted transaction batch.
pub type NewTransactionsSink = Arc<dyn Fn(&[TransactionInfo]) + Send + Sync>;

pub(crate) struct CommitStage {
    pub caches: Arc<CacheSet>,
    pub storage: Arc<dyn BlockStorage>,
    pub registry: Arc<PluginRegistry>,
    pub config: ChainConfig,
    pub score: Arc<ScoreTracker>,
    pub ut_cache: Arc<UtCache>,
    pub new_block_sink: NewBlockSink,
    pub new_transactions_sink: NewTransactionsSink,
}

fn abort(reason: AbortReason) -> CompletionStatus {
    CompletionStatus::Aborted(reason)
}

fn fatal(context: &str, detail: impl std::fmt::Display) -> KarstError {
    KarstError::Fatal(format!("{context}: {detail}"))
}

impl CommitStage {
    /// `(timestamp, difficulty)` samples for the window ending at
    /// `upto_height`, loaded from storage.
    fn difficulty_window(&self, upto_height: u64) -> Result<Vec<(u64, u64)>, KarstError> {
        let window = self.config.max_difficulty_blocks;
        let start = upto_height.saturating_sub(window.saturating_sub(1)).max(1);
        let mut samples = Vec::new();
        for height in start..=upto_height {
            let block = self
                .storage
                .load_block(height)
                .map_err(|e| fatal("difficulty window load", e))?
                .ok_or_else(|| fatal("difficulty window", format!("missing block {height}")))?;
            samples.push((block.timestamp, block.difficulty));
        }
        Ok(samples)
    }

    /// Process a block range. `Err` means a fatal invariant violation.
    pub fn process_block_range(
        &self,
        elements: Vec<BlockElement>,
    ) -> Result<CompletionStatus, KarstError> {
        let Some(first) = elements.first() else {
            return Ok(abort(AbortReason::EmptyRange));
        };
        let tip_height = self.storage.chain_height();
        let first_height = first.block.height;
        if first_height < 2 {
            return Ok(abort(AbortReason::Validation(ValidationFailure::HeightMismatch)));
        }
        if first_height > tip_height + 1 {
            return Ok(abort(AbortReason::MissingParent));
        }
        let common_height = first_height - 1;
        let rollback_depth = tip_height - common_height;
        if rollback_depth > self.config.max_rollback_blocks {
            return Ok(abort(AbortReason::RollbackTooDeep));
        }
        let parent = match self
            .storage
            .load_block_element(common_height)
            .map_err(|e| fatal("parent load", e))?
        {
            Some(parent) => parent,
            None => return Ok(abort(AbortReason::MissingParent)),
        };
        if parent.entity_hash != first.block.previous_hash {
            return Ok(abort(AbortReason::Validation(ValidationFailure::PreviousHashMismatch)));
        }

        // Speculative evaluation: rewind and apply everything on a
        // detached delta before any authoritative mutation.
        let mut detached = self.caches.create_detached_delta();
        let mut dropped_score = ChainScore::ZERO;
        let mut dropped_infos: Vec<TransactionInfo> = Vec::new();
        for height in ((common_height + 1)..=tip_height).rev() {
            let undo = self
                .storage
                .load_undo(height)
                .map_err(|e| fatal("undo load", e))?
                .ok_or_else(|| fatal("rewind", format!("missing undo data at {height}")))?;
            let element = self
                .storage
                .load_block_element(height)
                .map_err(|e| fatal("element load", e))?
                .ok_or_else(|| fatal("rewind", format!("missing block at {height}")))?;
            let below = self
                .storage
                .load_block(height - 1)
                .map_err(|e| fatal("block load", e))?
                .ok_or_else(|| fatal("rewind", format!("missing block at {}", height - 1)))?;
            dropped_score += score_between(&below, &element.block);
            dropped_infos.extend(element.transactions.iter().map(|te| TransactionInfo {
                transaction: te.transaction.clone(),
                entity_hash: te.entity_hash,
                merkle_component_hash: te.merkle_component_hash,
            }));
            detached.apply_undo(&undo);
        }

        let mut samples = self.difficulty_window(common_height)?;
        let mut prev = parent.clone();
        let mut added_score = ChainScore::ZERO;
        for element in &elements {
            if let ValidationResult::Failure(failure) =
                check_chain_link(&prev.block, &element.block)
            {
                return Ok(abort(AbortReason::Validation(failure)));
            }
            let expected_difficulty = next_difficulty(&samples, &self.config);
            if element.block.difficulty != expected_difficulty {
                return Ok(abort(AbortReason::Validation(ValidationFailure::DifficultyMismatch)));
            }
            if let Err(failure) =
                execute_block(&self.registry, &mut detached, element, &self.config)
            {
                return Ok(abort(AbortReason::Validation(failure)));
            }
            if let Some(boundary) = pruning_boundary(element.block.height, &self.config) {
                detached.prune(boundary);
            }
            if self.caches.state_hash_enabled()
                && detached.state_hash() != element.block.state_hash
            {
                return Ok(abort(AbortReason::Validation(ValidationFailure::StateHashMismatch)));
            }
            added_score += score_between(&prev.block, &element.block);
            samples.push((element.block.timestamp, element.block.difficulty));
            if samples.len() > self.config.max_difficulty_blocks as usize {
                samples.remove(0);
            }
            prev = element.clone();
        }

        // Chain selection applies whenever adopting means dropping blocks.
        let old_score = self.score.current();
        let rewound_score = ChainScore(old_score.0.saturating_sub(dropped_score.0));
        if rollback_depth > 0 {
            let current_tip = self
                .storage
                .load_block_element(tip_height)
                .map_err(|e| fatal("tip load", e))?
                .ok_or_else(|| fatal("tip load", format!("missing block at {tip_height}")))?;
            let candidate_score = ChainScore(rewound_score.0.saturating_add(added_score.0));
            let candidate_tip = elements.last().map(|e| e.entity_hash).unwrap_or_default();
            if !is_better_chain(
                (candidate_score, &candidate_tip),
                (old_score, &current_tip.entity_hash),
            ) {
                return Ok(abort(AbortReason::StaleScore));
            }
            info!(
                depth = rollback_depth,
                old_score = %old_score,
                new_score = %candidate_score,
                "switching to better chain",
            );
        }

        // Authoritative replay.
        if rollback_depth > 0 {
            let mut delta = self
                .caches
                .create_delta()
                .map_err(|e| fatal("rewind delta", e))?;
            for height in ((common_height + 1)..=tip_height).rev() {
                let undo = self
                    .storage
                    .load_undo(height)
                    .map_err(|e| fatal("undo load", e))?
                    .ok_or_else(|| fatal("rewind", format!("missing undo data at {height}")))?;
                delta.apply_undo(&undo);
            }
            self.caches
                .commit_rewound(delta, common_height)
                .map_err(|e| fatal("rewind commit", e))?;
            self.storage
                .drop_blocks_after(common_height)
                .map_err(|e| fatal("drop blocks", e))?;
            self.score.set(rewound_score);
        }

        let mut committed_hashes: HashSet<Hash256> = HashSet::new();
        let mut prev = parent;
        for element in elements {
            let mut delta = self
                .caches
                .create_delta()
                .map_err(|e| fatal("commit delta", e))?;
            execute_block(&self.registry, &mut delta, &element, &self.config)
                .map_err(|f| fatal("replay diverged from evaluation", f))?;
            if let Some(boundary) = pruning_boundary(element.block.height, &self.config) {
                delta.prune(boundary);
            }
            let undo = delta.undo();
            self.storage
                .save_block(element.clone(), undo)
                .map_err(|e| fatal("save block", e))?;
            let outcome = self
                .caches
                .commit(delta, None)
                .map_err(|e| fatal("commit", e))?;
            if self.caches.state_hash_enabled()
                && outcome.state_hash != element.block.state_hash
            {
                return Err(fatal(
                    "state hash mismatch after self-applied commit",
                    element.block.height,
                ));
            }
            self.score.add(score_between(&prev.block, &element.block));

            let hashes: Vec<Hash256> =
                element.transactions.iter().map(|te| te.entity_hash).collect();
            committed_hashes.extend(hashes.iter().copied());
            self.ut_cache.remove_confirmed(&hashes);
            debug!(height = element.block.height, hash = %element.entity_hash, "committed block");
            (self.new_block_sink)(&element);
            prev = element;
        }

        // Transactions only present on the abandoned branch go back to the
        // unconfirmed cache.
        for info in dropped_infos {
            if !committed_hashes.contains(&info.entity_hash) {
                if let Err(e) = self.ut_cache.insert(info) {
                    warn!("failed to revert transaction to unconfirmed cache: {e}");
                }
            }
        }

        Ok(CompletionStatus::Consumed)
    }

    /// Admit a transaction range into the unconfirmed cache.
    pub fn process_transaction_range(&self, infos: Vec<TransactionInfo>) -> CompletionStatus {
        if infos.is_empty() {
            return abort(AbortReason::EmptyRange);
        }
        let view = self.caches.create_view();
        let height = view.height() + 1;

        let mut accepted = Vec::new();
        let mut first_failure = None;
        for info in infos {
            match self.registry.validate_stateful(
                &info.transaction,
                &info.entity_hash,
                &view,
                height,
            ) {
                ValidationResult::Success | ValidationResult::Neutral => accepted.push(info),
                ValidationResult::Failure(failure) => {
                    debug!(hash = %info.entity_hash, %failure, "rejected transaction");
                    first_failure.get_or_insert(failure);
                }
            }
        }
        if accepted.is_empty() {
            return abort(match first_failure {
                Some(failure) => AbortReason::Validation(failure),
                None => AbortReason::EmptyRange,
            });
        }
        for info in &accepted {
            if let Err(e) = self.ut_cache.insert(info.clone()) {
                debug!(hash = %info.entity_hash, "not cached: {e}");
            }
        }
        (self.new_transactions_sink)(&accepted);
        CompletionStatus::Consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_cache::MemoryBlockStorage;
    use karst_consensus::harvester::Harvester;
    use karst_core::genesis;
    use karst_core::types::{Block, PublicKey, Transaction, TransactionBody};

    use crate::consumers::assemble_block_elements;

    const HOUR_MS: u64 = 3_600_000;

    struct Fixture {
        caches: Arc<CacheSet>,
        storage: Arc<MemoryBlockStorage>,
        ut_cache: Arc<UtCache>,
        harvester: Harvester,
        stage: CommitStage,
    }

    fn fixture() -> Fixture {
        let config = ChainConfig::default();
        let caches = Arc::new(CacheSet::seeded(&genesis::seed_accounts(), true));
        let genesis_element =
            BlockElement::compute(genesis::genesis_block(), &genesis::genesis_hash()).unwrap();
        let storage = Arc::new(MemoryBlockStorage::with_genesis(genesis_element));
        let ut_cache = Arc::new(UtCache::new());
        let registry = Arc::new(PluginRegistry::builtin());

        let harvester = Harvester::new(
            (0..4).map(genesis::seed_key).collect(),
            config.clone(),
            Arc::clone(&caches),
            Arc::clone(&ut_cache),
            Arc::clone(&registry),
        );
        let stage = CommitStage {
            caches: Arc::clone(&caches),
            storage: Arc::clone(&storage) as Arc<dyn BlockStorage>,
            registry,
            config,
            score: Arc::new(ScoreTracker::new(ChainScore::ZERO)),
            ut_cache: Arc::clone(&ut_cache),
            new_block_sink: Arc::new(|_| {}),
            new_transactions_sink: Arc::new(|_| {}),
        };
        Fixture { caches, storage, ut_cache, harvester, stage }
    }

    impl Fixture {
        fn forge_next(&self, elapsed_ms: u64) -> Block {
            let tip = self.storage.chain_height();
            let parent = self.storage.load_block_element(tip).unwrap().unwrap();
            let samples = self.stage.difficulty_window(tip).unwrap();
            self.harvester
                .harvest(&parent, parent.block.timestamp + elapsed_ms, &samples)
                .expect("an hour of elapsed time makes every seed key eligible")
        }

        fn submit(&self, blocks: Vec<Block>) -> CompletionStatus {
            let elements = match assemble_block_elements(blocks, self.storage.as_ref()) {
                Ok(elements) => elements,
                Err(reason) => return CompletionStatus::Aborted(reason),
            };
            self.stage.process_block_range(elements).unwrap()
        }
    }

    // ------------------------------------------------------------------
    // Extension commits
    // ------------------------------------------------------------------

    #[test]
    fn commits_forged_block_and_advances_state() {
        let fx = fixture();
        let block = fx.forge_next(HOUR_MS);
        let status = fx.submit(vec![block.clone()]);

        assert_eq!(status, CompletionStatus::Consumed);
        assert_eq!(fx.storage.chain_height(), 2);
        assert_eq!(fx.caches.height(), 2);
        assert_eq!(fx.caches.state_hash(), block.state_hash);
        assert!(fx.stage.score.current() > ChainScore::ZERO);
    }

    #[test]
    fn commits_multi_block_range_in_order() {
        let fx = fixture();
        let b2 = fx.forge_next(HOUR_MS);
        fx.submit(vec![b2.clone()]);
        let b3 = fx.forge_next(HOUR_MS);
        fx.submit(vec![b3.clone()]);
        assert_eq!(fx.storage.chain_height(), 3);
        assert_eq!(fx.storage.load_block(2).unwrap().unwrap(), b2);
        assert_eq!(fx.storage.load_block(3).unwrap().unwrap(), b3);
    }

    #[test]
    fn rejects_declared_state_hash_mismatch() {
        let fx = fixture();
        let mut block = fx.forge_next(HOUR_MS);
        block.state_hash = Hash256([0xEE; 32]);
        // Re-sign so only the state hash is wrong.
        let key = genesis::seed_key(0);
        let signer = key.public_key();
        block.signer = signer;
        block.signature = key.sign(&block.header_bytes());

        let status = fx.submit(vec![block]);
        assert_eq!(
            status,
            CompletionStatus::Aborted(AbortReason::Validation(
                ValidationFailure::StateHashMismatch,
            )),
        );
        assert_eq!(fx.caches.height(), 1, "no state mutation on abort");
    }

    #[test]
    fn rejects_wrong_difficulty() {
        let fx = fixture();
        let mut block = fx.forge_next(HOUR_MS);
        block.difficulty += 1;
        let key = genesis::seed_key(0);
        block.signer = key.public_key();
        block.signature = key.sign(&block.header_bytes());

        assert_eq!(
            fx.submit(vec![block]),
            CompletionStatus::Aborted(AbortReason::Validation(
                ValidationFailure::DifficultyMismatch,
            )),
        );
    }

    #[test]
    fn rejects_gap_ranges() {
        let fx = fixture();
        let block = fx.forge_next(HOUR_MS);
        fx.submit(vec![block]);
        let mut future = fx.forge_next(HOUR_MS);
        future.height = 9;
        assert_eq!(
            fx.submit(vec![future]),
            CompletionStatus::Aborted(AbortReason::MissingParent),
        );
    }

    // ------------------------------------------------------------------
    // Reorganization
    // ------------------------------------------------------------------

    /// Build two fixtures sharing genesis, fork them one block deep, and
    /// return the losing fixture plus the winning branch's blocks.
    fn forked_fixtures() -> (Fixture, Vec<Block>) {
        // Loser: one slow block.
        let loser = fixture();
        let slow = loser.forge_next(HOUR_MS + 600_000);
        assert_eq!(loser.submit(vec![slow]), CompletionStatus::Consumed);

        // Winner: two fast blocks on a separate fixture.
        let winner = fixture();
        let fast1 = winner.forge_next(HOUR_MS);
        assert_eq!(winner.submit(vec![fast1.clone()]), CompletionStatus::Consumed);
        let fast2 = winner.forge_next(HOUR_MS);
        assert_eq!(winner.submit(vec![fast2.clone()]), CompletionStatus::Consumed);

        (loser, vec![fast1, fast2])
    }

    #[test]
    fn adopts_higher_scoring_fork() {
        let (loser, winning_blocks) = forked_fixtures();
        let winning_tip = winning_blocks.last().unwrap().clone();

        let status = loser.submit(winning_blocks);
        assert_eq!(status, CompletionStatus::Consumed);
        assert_eq!(loser.storage.chain_height(), 3);
        assert_eq!(
            loser.storage.load_block(3).unwrap().unwrap().entity_hash(),
            winning_tip.entity_hash(),
        );
        assert_eq!(loser.caches.state_hash(), winning_tip.state_hash);
    }

    #[test]
    fn rejects_lower_scoring_fork() {
        // Winner first: commit the fast branch locally, then offer the
        // slow branch.
        let fast = fixture();
        let fast1 = fast.forge_next(HOUR_MS);
        fast.submit(vec![fast1]);
        let fast2 = fast.forge_next(HOUR_MS);
        fast.submit(vec![fast2]);
        let score_before = fast.stage.score.current();

        let slow = fixture();
        let slow1 = slow.forge_next(HOUR_MS + 600_000);
        slow.submit(vec![slow1.clone()]);

        assert_eq!(
            fast.submit(vec![slow1]),
            CompletionStatus::Aborted(AbortReason::StaleScore),
        );
        assert_eq!(fast.stage.score.current(), score_before);
        assert_eq!(fast.storage.chain_height(), 3);
    }

    #[test]
    fn reorg_reverts_orphaned_transactions() {
        let loser = fixture();
        // The losing branch carries a transaction.
        let key = genesis::seed_key(5);
        let mut tx = Transaction {
            signer: key.public_key(),
            deadline: u64::MAX,
            max_fee: 10,
            body: TransactionBody::Transfer { recipient: PublicKey([0x42; 32]), amount: 100 },
            signature: vec![],
        };
        tx.signature = key.sign(&tx.unsigned_bytes().unwrap());
        let info = TransactionInfo::from_transaction(tx).unwrap();
        loser.ut_cache.insert(info.clone()).unwrap();

        let slow = loser.forge_next(HOUR_MS + 600_000);
        assert_eq!(slow.transactions.len(), 1);
        assert_eq!(loser.submit(vec![slow]), CompletionStatus::Consumed);
        assert!(!loser.ut_cache.contains(&info.entity_hash), "confirmed, so evicted");

        // A transaction-free winning branch displaces it.
        let winner = fixture();
        let fast1 = winner.forge_next(HOUR_MS);
        winner.submit(vec![fast1.clone()]);
        let fast2 = winner.forge_next(HOUR_MS);
        winner.submit(vec![fast2.clone()]);

        assert_eq!(loser.submit(vec![fast1, fast2]), CompletionStatus::Consumed);
        assert!(
            loser.ut_cache.contains(&info.entity_hash),
            "orphaned transaction returns to the unconfirmed cache",
        );
    }

    #[test]
    fn rejects_rollback_past_limit() {
        let config = ChainConfig {
            importance_grouping: 4,
            max_rollback_blocks: 3,
            max_difficulty_blocks: 2,
            ..ChainConfig::default()
        };
        let caches = Arc::new(CacheSet::seeded(&genesis::seed_accounts(), true));
        let genesis_element =
            BlockElement::compute(genesis::genesis_block(), &genesis::genesis_hash()).unwrap();
        let storage = Arc::new(MemoryBlockStorage::with_genesis(genesis_element));
        let ut_cache = Arc::new(UtCache::new());
        let registry = Arc::new(PluginRegistry::builtin());
        let harvester = Harvester::new(
            (0..4).map(genesis::seed_key).collect(),
            config.clone(),
            Arc::clone(&caches),
            Arc::clone(&ut_cache),
            Arc::clone(&registry),
        );
        let stage = CommitStage {
            caches: Arc::clone(&caches),
            storage: Arc::clone(&storage) as Arc<dyn BlockStorage>,
            registry,
            config,
            score: Arc::new(ScoreTracker::new(ChainScore::ZERO)),
            ut_cache,
            new_block_sink: Arc::new(|_| {}),
            new_transactions_sink: Arc::new(|_| {}),
        };
        let fx = Fixture { caches, storage, ut_cache: Arc::new(UtCache::new()), harvester, stage };

        // Grow the local chain 5 blocks past genesis.
        for _ in 0..5 {
            let block = fx.forge_next(HOUR_MS);
            assert_eq!(fx.submit(vec![block]), CompletionStatus::Consumed);
        }

        // A fork from genesis would need a rollback of depth 5 > 3.
        let other = fixture();
        let fork = other.forge_next(HOUR_MS / 2);
        let elements = assemble_block_elements(vec![fork], fx.storage.as_ref()).unwrap();
        assert_eq!(
            fx.stage.process_block_range(elements).unwrap(),
            CompletionStatus::Aborted(AbortReason::RollbackTooDeep),
        );
        assert_eq!(fx.storage.chain_height(), 6);
    }

    // ------------------------------------------------------------------
    // Transaction ranges
    // ------------------------------------------------------------------

    fn signed_transfer(seed: u8, amount: u64) -> TransactionInfo {
        let key = genesis::seed_key(seed);
        let mut tx = Transaction {
            signer: key.public_key(),
            deadline: u64::MAX,
            max_fee: 1,
            body: TransactionBody::Transfer { recipient: PublicKey([0x42; 32]), amount },
            signature: vec![],
        };
        tx.signature = key.sign(&tx.unsigned_bytes().unwrap());
        TransactionInfo::from_transaction(tx).unwrap()
    }

    #[test]
    fn admits_valid_transactions() {
        let fx = fixture();
        let info = signed_transfer(0, 1_000);
        let status = fx.stage.process_transaction_range(vec![info.clone()]);
        assert_eq!(status, CompletionStatus::Consumed);
        assert!(fx.ut_cache.contains(&info.entity_hash));
    }

    #[test]
    fn reports_specific_validation_failure() {
        let fx = fixture();
        let overspend = signed_transfer(0, genesis::SEED_ACCOUNT_BALANCE * 2);
        assert_eq!(
            fx.stage.process_transaction_range(vec![overspend]),
            CompletionStatus::Aborted(AbortReason::Validation(
                ValidationFailure::InsufficientBalance,
            )),
        );
    }

    #[test]
    fn partial_batches_keep_the_valid_subset() {
        let fx = fixture();
        let good = signed_transfer(0, 1_000);
        let bad = signed_transfer(1, genesis::SEED_ACCOUNT_BALANCE * 2);
        assert_eq!(
            fx.stage.process_transaction_range(vec![bad, good.clone()]),
            CompletionStatus::Consumed,
        );
        assert_eq!(fx.ut_cache.len(), 1);
        assert!(fx.ut_cache.contains(&good.entity_hash));
    }
}

//! The chain synchronizer.
//!
//! Each round samples peers for their chain info, picks the best peer
//! strictly ahead of the local score, negotiates a common ancestor by
//! walking hash windows backward, pulls the divergent suffix in chunks,
//! and evaluates it on a detached delta. Only suffixes that win chain
//! selection are handed to the pipeline (marked remote-pull); the commit
//! stage performs the authoritative rollback-and-apply. Nothing in this
//! module mutates local state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use karst_cache::{BlockStorage, CacheSet};
use karst_consensus::executor::{check_chain_link, execute_block, pruning_boundary};
use karst_consensus::plugins::PluginRegistry;
use karst_consensus::score::{is_better_chain, score_between, ChainScore, ScoreTracker};
use karst_core::chain_config::ChainConfig;
use karst_core::clock::NetworkClock;
use karst_core::element::BlockElement;
use karst_core::error::{SyncError, ValidationFailure, ValidationResult};
use karst_core::types::{Block, Hash256};
use karst_pipeline::ProcessingCompleteFn;

use crate::api::ChainApi;
use crate::peers::{PeerId, PeerRegistry};

/// Per-request timeout for peer calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Hashes requested per ancestor-negotiation window.
pub const HASH_WINDOW: u32 = 128;

/// Blocks pulled per chunk.
pub const BLOCK_CHUNK: u32 = 100;

/// Hands an adopted suffix to the pipeline (source remote-pull).
pub type BlockRangeConsumer = Arc<dyn Fn(Vec<Block>, ProcessingCompleteFn) + Send + Sync>;

/// Result of one synchronization round.
#[derive(Debug)]
pub enum SyncRoundOutcome {
    /// No reachable peer advertised a better chain.
    NoPeersAhead,
    /// A better suffix was pulled, verified, and submitted.
    Synchronized { peer: PeerId, blocks: usize },
    /// The best peer forked beyond the rollback limit.
    PeerIncompatible(PeerId),
    /// The round aborted; the peer is briefly blacklisted.
    RoundFailed { peer: PeerId, error: SyncError },
}

pub struct ChainSynchronizer {
    storage: Arc<dyn BlockStorage>,
    caches: Arc<CacheSet>,
    registry: Arc<PluginRegistry>,
    score: Arc<ScoreTracker>,
    config: ChainConfig,
    clock: Arc<dyn NetworkClock>,
    peers: PeerRegistry,
    range_consumer: BlockRangeConsumer,
}

impl ChainSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn BlockStorage>,
        caches: Arc<CacheSet>,
        registry: Arc<PluginRegistry>,
        score: Arc<ScoreTracker>,
        config: ChainConfig,
        clock: Arc<dyn NetworkClock>,
        range_consumer: BlockRangeConsumer,
    ) -> Self {
        Self {
            storage,
            caches,
            registry,
            score,
            config,
            clock,
            peers: PeerRegistry::new(),
            range_consumer,
        }
    }

    /// Peer bookkeeping (blacklist and incompatibility state).
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Run one round against the given peer set.
    pub async fn synchronize_round(
        &self,
        peers: &[(PeerId, Arc<dyn ChainApi>)],
    ) -> SyncRoundOutcome {
        let now_ms = self.clock.now_ms();
        let local_score = self.score.current();

        let mut best: Option<(PeerId, &Arc<dyn ChainApi>, ChainScore, u64)> = None;
        for (peer, api) in peers {
            if !self.peers.is_usable(*peer, now_ms) {
                continue;
            }
            match timeout(REQUEST_TIMEOUT, api.chain_info()).await {
                Ok(Ok(info)) => {
                    debug!(%peer, score = %info.score, height = info.height, "peer chain info");
                    if info.score > local_score
                        && best.as_ref().map(|(_, _, score, _)| info.score > *score).unwrap_or(true)
                    {
                        best = Some((*peer, api, info.score, info.height));
                    }
                }
                Ok(Err(error)) => {
                    debug!(%peer, %error, "chain info failed");
                    self.peers.report_failure(*peer, now_ms);
                }
                Err(_) => {
                    debug!(%peer, "chain info timed out");
                    self.peers.report_failure(*peer, now_ms);
                }
            }
        }
        let Some((peer, api, peer_score, peer_height)) = best else {
            return SyncRoundOutcome::NoPeersAhead;
        };

        match self.pull_and_evaluate(api.as_ref(), peer_score, peer_height).await {
            Ok(blocks) => {
                let count = blocks.len();
                info!(%peer, blocks = count, "submitting pulled chain part");
                (self.range_consumer)(
                    blocks,
                    Box::new(move |id, status| {
                        debug!(input = id, "pulled range completed: {status:?}");
                    }),
                );
                SyncRoundOutcome::Synchronized { peer, blocks: count }
            }
            Err(error) if error.is_incompatible() => {
                warn!(%peer, %error, "peer classified incompatible");
                self.peers.mark_incompatible(peer, now_ms);
                SyncRoundOutcome::PeerIncompatible(peer)
            }
            Err(error) => {
                warn!(%peer, %error, "synchronization round failed");
                self.peers.report_failure(peer, now_ms);
                SyncRoundOutcome::RoundFailed { peer, error }
            }
        }
    }

    async fn pull_and_evaluate(
        &self,
        api: &dyn ChainApi,
        peer_score: ChainScore,
        peer_height: u64,
    ) -> Result<Vec<Block>, SyncError> {
        let ancestor = self.find_common_ancestor(api, peer_height).await?;
        let blocks = self.pull_suffix(api, ancestor, peer_height).await?;
        let (new_score, tip_hash) = self.evaluate_suffix(ancestor, &blocks)?;

        let local_height = self.storage.chain_height();
        let local_tip = self
            .storage
            .load_block_element(local_height)
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?
            .ok_or_else(|| SyncError::LocalStorage(format!("missing tip at {local_height}")))?;
        if !is_better_chain((new_score, &tip_hash), (self.score.current(), &local_tip.entity_hash))
        {
            return Err(SyncError::ScoreRegression);
        }
        if new_score < peer_score {
            debug!(claimed = %peer_score, actual = %new_score, "peer overstated its score");
        }
        Ok(blocks)
    }

    /// Walk hash windows backward from `min(peer, local)` height until a
    /// shared hash is found.
    async fn find_common_ancestor(
        &self,
        api: &dyn ChainApi,
        peer_height: u64,
    ) -> Result<u64, SyncError> {
        let local_height = self.storage.chain_height();
        let rollback_limit = local_height.saturating_sub(self.config.max_rollback_blocks);
        let mut window_end = peer_height.min(local_height).max(1);

        loop {
            let window_start = window_end.saturating_sub(HASH_WINDOW as u64 - 1).max(1);
            let count = (window_end - window_start + 1) as u32;
            let peer_hashes = timeout(REQUEST_TIMEOUT, api.hashes_from(window_start, count))
                .await
                .map_err(|_| SyncError::Timeout)??;
            let local_hashes = self
                .storage
                .load_hashes_from(window_start, count as usize)
                .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

            let n = peer_hashes.len().min(local_hashes.len());
            for i in (0..n).rev() {
                if peer_hashes[i] == local_hashes[i] {
                    let ancestor = window_start + i as u64;
                    if ancestor < rollback_limit {
                        return Err(SyncError::RollbackTooDeep { ancestor, local: local_height });
                    }
                    return Ok(ancestor);
                }
            }

            if window_start <= rollback_limit.max(1) {
                // Any ancestor below this window is already beyond the
                // rollback limit; at window start 1 the chains share no
                // genesis at all.
                if window_start == 1 && rollback_limit <= 1 {
                    return Err(SyncError::ChainBroken);
                }
                return Err(SyncError::RollbackTooDeep {
                    ancestor: window_start,
                    local: local_height,
                });
            }
            window_end = window_start - 1;
        }
    }

    /// Pull `(ancestor, peer_height]` in size-capped chunks.
    async fn pull_suffix(
        &self,
        api: &dyn ChainApi,
        ancestor: u64,
        peer_height: u64,
    ) -> Result<Vec<Block>, SyncError> {
        let mut blocks = Vec::new();
        let mut next = ancestor + 1;
        while next <= peer_height {
            let chunk = timeout(REQUEST_TIMEOUT, api.blocks_from(next, BLOCK_CHUNK))
                .await
                .map_err(|_| SyncError::Timeout)??;
            if chunk.is_empty() {
                break;
            }
            next += chunk.len() as u64;
            blocks.extend(chunk);
        }
        if blocks.is_empty() {
            // The peer advertised a better score but produced no blocks.
            return Err(SyncError::ScoreRegression);
        }
        Ok(blocks)
    }

    /// Rewind a detached delta to `ancestor` and apply the pulled suffix,
    /// returning the resulting chain score and tip hash.
    fn evaluate_suffix(
        &self,
        ancestor: u64,
        blocks: &[Block],
    ) -> Result<(ChainScore, Hash256), SyncError> {
        let local_height = self.storage.chain_height();
        let mut detached = self.caches.create_detached_delta();
        let mut dropped_score = ChainScore::ZERO;
        for height in ((ancestor + 1)..=local_height).rev() {
            let undo = self
                .storage
                .load_undo(height)
                .map_err(|e| SyncError::LocalStorage(e.to_string()))?
                .ok_or_else(|| SyncError::LocalStorage(format!("missing undo at {height}")))?;
            let block = self
                .storage
                .load_block(height)
                .map_err(|e| SyncError::LocalStorage(e.to_string()))?
                .ok_or_else(|| SyncError::LocalStorage(format!("missing block at {height}")))?;
            let below = self
                .storage
                .load_block(height - 1)
                .map_err(|e| SyncError::LocalStorage(e.to_string()))?
                .ok_or_else(|| SyncError::LocalStorage(format!("missing block at {}", height - 1)))?;
            dropped_score += score_between(&below, &block);
            detached.apply_undo(&undo);
        }

        let mut prev = self
            .storage
            .load_block_element(ancestor)
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?
            .ok_or_else(|| SyncError::LocalStorage(format!("missing ancestor at {ancestor}")))?;
        let mut added_score = ChainScore::ZERO;
        for block in blocks {
            if let ValidationResult::Failure(failure) = check_chain_link(&prev.block, block) {
                return Err(SyncError::InvalidBlock(failure));
            }
            if karst_core::crypto::verify(&block.signer, &block.header_bytes(), &block.signature)
                .is_err()
            {
                return Err(SyncError::InvalidBlock(ValidationFailure::SignatureInvalid));
            }
            let element = BlockElement::compute(block.clone(), &prev.generation_hash)
                .map_err(|_| SyncError::InvalidBlock(ValidationFailure::SignatureInvalid))?;
            execute_block(&self.registry, &mut detached, &element, &self.config)
                .map_err(SyncError::InvalidBlock)?;
            if let Some(boundary) = pruning_boundary(block.height, &self.config) {
                detached.prune(boundary);
            }
            if self.caches.state_hash_enabled() && detached.state_hash() != block.state_hash {
                return Err(SyncError::InvalidBlock(ValidationFailure::StateHashMismatch));
            }
            added_score += score_between(&prev.block, block);
            prev = element;
        }

        let local_score = self.score.current();
        let new_score =
            ChainScore(local_score.0.saturating_sub(dropped_score.0).saturating_add(added_score.0));
        Ok((new_score, prev.entity_hash))
    }
}

//! Block execution against a cache delta.
//!
//! The executor is the single place where a block's transactions mutate
//! state: fees move first, then the body plugin applies, and importance
//! snapshots are recorded at group heights. Both the commit stage and every
//! speculative evaluation (harvesting, peer-chain scoring) run this exact
//! code, which is what makes declared state hashes reproducible.

use karst_cache::DeltaSet;
use karst_core::chain_config::ChainConfig;
use karst_core::element::BlockElement;
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Block, Hash256, Transaction};

use crate::plugins::{credit, debit, PluginRegistry};

/// Apply one transaction: fee to the block signer, then the body.
///
/// On failure the delta may hold partial changes; callers either abort the
/// whole block (commit path) or discard the trial delta (harvester path).
pub fn apply_transaction(
    registry: &PluginRegistry,
    state: &mut DeltaSet,
    tx: &Transaction,
    entity_hash: &Hash256,
    block_signer: &karst_core::types::PublicKey,
    height: u64,
) -> Result<(), ValidationFailure> {
    if tx.max_fee > 0 {
        debit(state, &tx.signer, tx.max_fee)?;
        credit(state, block_signer, tx.max_fee)?;
    }
    registry.apply(tx, entity_hash, state, height)
}

/// Execute every transaction of `element` into `state` and record
/// importance snapshots when the height is an importance-group multiple.
///
/// Does not prune; pruning belongs to the commit (or the speculative
/// equivalent) so the boundary is applied exactly once per block.
pub fn execute_block(
    registry: &PluginRegistry,
    state: &mut DeltaSet,
    element: &BlockElement,
    config: &ChainConfig,
) -> Result<(), ValidationFailure> {
    let height = element.block.height;
    for te in &element.transactions {
        apply_transaction(
            registry,
            state,
            &te.transaction,
            &te.entity_hash,
            &element.block.signer,
            height,
        )?;
    }
    if config.importance_grouping > 0 && height % config.importance_grouping == 0 {
        state.record_importances(height);
    }
    Ok(())
}

/// The pruning boundary in effect for a block at `height`.
pub fn pruning_boundary(height: u64, config: &ChainConfig) -> Option<u64> {
    height.checked_sub(config.max_rollback_blocks).filter(|b| *b > 0)
}

/// Check that `child` structurally extends `parent`.
pub fn check_chain_link(parent: &Block, child: &Block) -> ValidationResult {
    if child.height != parent.height + 1 {
        return ValidationResult::Failure(ValidationFailure::HeightMismatch);
    }
    if child.previous_hash != parent.entity_hash() {
        return ValidationResult::Failure(ValidationFailure::PreviousHashMismatch);
    }
    if child.timestamp <= parent.timestamp {
        return ValidationResult::Failure(ValidationFailure::TimestampNotAfterParent);
    }
    ValidationResult::Success
}

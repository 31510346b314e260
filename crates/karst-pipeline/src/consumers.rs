//! Filter, transform, and validation stages.
//!
//! Every function here is pure over its inputs (plus the recency set, which
//! is stage-local state); only the commit stage touches the authoritative
//! caches.

use std::collections::{HashSet, VecDeque};

use karst_cache::BlockStorage;
use karst_consensus::plugins::PluginRegistry;
use karst_core::element::{BlockElement, TransactionInfo};
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Block, Hash256, Transaction};

use crate::input::AbortReason;

/// Bounded set remembering recently seen entity hashes.
///
/// Backs the known-hash filter so re-pushed entities are dropped cheaply
/// instead of revalidated.
pub struct RecencySet {
    seen: HashSet<Hash256>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl RecencySet {
    pub fn new(capacity: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), capacity }
    }

    /// Record `hash`; returns `true` when it was not seen before.
    pub fn observe(&mut self, hash: Hash256) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.seen.contains(hash)
    }
}

/// Drop a block range in which nothing is new.
pub fn filter_known_blocks(
    blocks: &[Block],
    recency: &mut RecencySet,
) -> Result<(), AbortReason> {
    if blocks.is_empty() {
        return Err(AbortReason::EmptyRange);
    }
    let mut any_fresh = false;
    for block in blocks {
        if recency.observe(block.entity_hash()) {
            any_fresh = true;
        }
    }
    if any_fresh {
        Ok(())
    } else {
        Err(AbortReason::KnownHash)
    }
}

/// Keep only transactions that are neither recently seen nor known to the
/// unconfirmed cache.
pub fn filter_known_transactions(
    transactions: Vec<Transaction>,
    recency: &mut RecencySet,
    known_hash: &dyn Fn(&Hash256) -> bool,
) -> Result<Vec<TransactionInfo>, AbortReason> {
    if transactions.is_empty() {
        return Err(AbortReason::EmptyRange);
    }
    let mut fresh = Vec::new();
    for tx in transactions {
        let Ok(info) = TransactionInfo::from_transaction(tx) else {
            return Err(AbortReason::Validation(ValidationFailure::SignatureInvalid));
        };
        if known_hash(&info.entity_hash) || !recency.observe(info.entity_hash) {
            continue;
        }
        fresh.push(info);
    }
    if fresh.is_empty() {
        return Err(AbortReason::KnownHash);
    }
    Ok(fresh)
}

/// Assemble block elements for a range, chaining generation hashes from
/// the stored parent of the first block.
pub fn assemble_block_elements(
    blocks: Vec<Block>,
    storage: &dyn BlockStorage,
) -> Result<Vec<BlockElement>, AbortReason> {
    let first = blocks.first().ok_or(AbortReason::EmptyRange)?;
    let parent_height = first.height.checked_sub(1).ok_or(AbortReason::MissingParent)?;
    let parent = storage
        .load_block_element(parent_height)
        .map_err(|_| AbortReason::MissingParent)?
        .ok_or(AbortReason::MissingParent)?;
    if parent.entity_hash != first.previous_hash {
        return Err(AbortReason::Validation(ValidationFailure::PreviousHashMismatch));
    }

    let mut elements = Vec::with_capacity(blocks.len());
    let mut generation = parent.generation_hash;
    for block in blocks {
        let element = BlockElement::compute(block, &generation)
            .map_err(|_| AbortReason::Validation(ValidationFailure::SignatureInvalid))?;
        generation = element.generation_hash;
        elements.push(element);
    }
    Ok(elements)
}

/// Stateless block checks: signature, merkle commitment, transaction
/// signatures, deadlines, and plugin structure rules.
pub fn validate_block_stateless(
    element: &BlockElement,
    registry: &PluginRegistry,
) -> ValidationResult {
    let block = &element.block;
    if karst_core::crypto::verify(&block.signer, &block.header_bytes(), &block.signature).is_err()
    {
        return ValidationResult::Failure(ValidationFailure::SignatureInvalid);
    }
    if block.transactions_hash != element.transactions_merkle_root() {
        return ValidationResult::Failure(ValidationFailure::TransactionsHashMismatch);
    }
    for te in &element.transactions {
        let result = validate_transaction_stateless(&te.transaction, block.timestamp, registry);
        if !result.is_success() {
            return result;
        }
    }
    ValidationResult::Success
}

/// Stateless transaction checks against a reference time (the containing
/// block's timestamp, or network time for mempool admission).
pub fn validate_transaction_stateless(
    tx: &Transaction,
    reference_time_ms: u64,
    registry: &PluginRegistry,
) -> ValidationResult {
    if tx.deadline < reference_time_ms {
        return ValidationResult::Failure(ValidationFailure::DeadlinePassed);
    }
    let Ok(unsigned) = tx.unsigned_bytes() else {
        return ValidationResult::Failure(ValidationFailure::SignatureInvalid);
    };
    if karst_core::crypto::verify(&tx.signer, &unsigned, &tx.signature).is_err() {
        return ValidationResult::Failure(ValidationFailure::SignatureInvalid);
    }
    registry.validate_stateless(tx)
}

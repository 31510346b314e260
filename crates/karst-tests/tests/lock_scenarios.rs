//! End-to-end hash-lock scenarios driven through the full node pipeline.
//!
//! A lock is posted for a future bonded aggregate's entity hash, the
//! aggregate is admitted and confirmed while the lock is active, and
//! reuse or late arrival is rejected with the specific failure code.

use karst_cache::{LockStatus, StateRead};
use karst_consensus::plugins::PluginRegistry;
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Hash256, PublicKey, TransactionBody};
use karst_node_lib::NodeConfig;
use karst_pipeline::{AbortReason, CompletionStatus};
use karst_tests::helpers::{capturing_completion, signed_tx, wait_until, TestNode};

const BLOCK_TIME_MS: u64 = 60_000;

fn aggregate_and_lock(duration: u64) -> (karst_core::types::Transaction, karst_core::types::Transaction, Hash256) {
    let aggregate = signed_tx(
        0,
        TransactionBody::AggregateBonded { transfers: vec![(PublicKey([0x42; 32]), 100)] },
    );
    let aggregate_hash = aggregate.entity_hash().unwrap();
    let lock = signed_tx(
        1,
        TransactionBody::HashLock { lock_hash: aggregate_hash, amount: 10_000, duration },
    );
    (aggregate, lock, aggregate_hash)
}

/// Push one transaction and return its completion status.
async fn push_tx(node: &TestNode, tx: karst_core::types::Transaction) -> CompletionStatus {
    let (completion, slot) = capturing_completion();
    node.node.push_transactions(vec![tx], completion).await;
    wait_until(|| slot.lock().is_some()).await;
    let status = slot.lock().take();
    status.expect("completion fired")
}

#[tokio::test]
async fn aggregate_accepted_while_lock_is_active() {
    let node = TestNode::new(1);
    let (aggregate, lock, aggregate_hash) = aggregate_and_lock(10);

    // Confirm the lock in block 2; it expires at height 12.
    assert_eq!(push_tx(&node, lock).await, CompletionStatus::Consumed);
    node.grow(1, BLOCK_TIME_MS).await;
    let view = node.node.state_view();
    let info = view.hash_lock(&aggregate_hash).expect("lock confirmed");
    assert_eq!(info.status, LockStatus::Unused);
    assert_eq!(info.expiration_height, 12);

    // The aggregate is admitted while the lock is active and confirms in
    // the next harvested block.
    assert_eq!(push_tx(&node, aggregate.clone()).await, CompletionStatus::Consumed);
    node.grow(1, BLOCK_TIME_MS).await;

    let view = node.node.state_view();
    let info = view.hash_lock(&aggregate_hash).expect("lock survives use");
    assert_eq!(info.status, LockStatus::Used, "commit flips the lock to Used");

    // Reuse is rejected by the authoritative state.
    let registry = PluginRegistry::builtin();
    assert_eq!(
        registry.validate_stateful(&aggregate, &aggregate_hash, &view, view.height() + 1),
        ValidationResult::Failure(ValidationFailure::HashAlreadyUsed),
    );
}

#[tokio::test]
async fn aggregate_rejected_at_expiration_height() {
    let node = TestNode::new(1);
    let (aggregate, lock, aggregate_hash) = aggregate_and_lock(3);

    // Lock confirms in block 2, expiring at height 5.
    assert_eq!(push_tx(&node, lock).await, CompletionStatus::Consumed);
    node.grow(1, BLOCK_TIME_MS).await;

    // Grow to height 4: the aggregate would confirm at height 5, exactly
    // the expiration height.
    node.grow(2, BLOCK_TIME_MS).await;
    assert_eq!(node.node.chain_height(), 4);

    assert_eq!(
        push_tx(&node, aggregate).await,
        CompletionStatus::Aborted(AbortReason::Validation(ValidationFailure::InactiveHash)),
    );

    // The lock itself is untouched.
    let view = node.node.state_view();
    assert_eq!(view.hash_lock(&aggregate_hash).unwrap().status, LockStatus::Unused);
}

#[tokio::test]
async fn aggregate_rejected_after_expiration_height() {
    let node = TestNode::new(1);
    let (aggregate, lock, aggregate_hash) = aggregate_and_lock(3);

    assert_eq!(push_tx(&node, lock).await, CompletionStatus::Consumed);
    node.grow(1, BLOCK_TIME_MS).await;

    // Well past the expiration height.
    node.grow(5, BLOCK_TIME_MS).await;
    assert_eq!(node.node.chain_height(), 7);

    assert_eq!(
        push_tx(&node, aggregate).await,
        CompletionStatus::Aborted(AbortReason::Validation(ValidationFailure::InactiveHash)),
    );
    let view = node.node.state_view();
    assert_eq!(view.hash_lock(&aggregate_hash).unwrap().status, LockStatus::Unused);
}

#[tokio::test]
async fn unbacked_aggregate_is_rejected_outright() {
    let node = TestNode::new(1);
    let (aggregate, _, _) = aggregate_and_lock(10);

    // No lock was ever posted.
    assert_eq!(
        push_tx(&node, aggregate).await,
        CompletionStatus::Aborted(AbortReason::Validation(ValidationFailure::HashDoesNotExist)),
    );
}

#[tokio::test]
async fn expired_locks_are_pruned_past_the_rollback_window() {
    // A tight rollback window keeps the pruning boundary close to the tip.
    let config = NodeConfig {
        chain: karst_core::chain_config::ChainConfig {
            importance_grouping: 4,
            max_rollback_blocks: 3,
            max_difficulty_blocks: 2,
            ..karst_core::chain_config::ChainConfig::default()
        },
        ..NodeConfig::default()
    };
    let node = TestNode::with_config(1, config);
    let (_, lock, aggregate_hash) = aggregate_and_lock(2);

    // Lock confirms in block 2 and expires at height 4.
    assert_eq!(push_tx(&node, lock).await, CompletionStatus::Consumed);
    node.grow(1, BLOCK_TIME_MS).await;
    assert!(node.node.state_view().hash_lock(&aggregate_hash).is_some());

    // At height 7 the boundary reaches the expiration height and the
    // entry is dropped on commit.
    node.grow(5, BLOCK_TIME_MS).await;
    assert_eq!(node.node.chain_height(), 7);
    assert!(
        node.node.state_view().hash_lock(&aggregate_hash).is_none(),
        "expired lock is pruned once the boundary passes it",
    );
}

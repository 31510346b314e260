//! Multi-node convergence tests.
//!
//! Every node is seeded with a distinct chain forged from the shared
//! genesis, with per-node block spacing so all chains score differently.
//! Synchronization rounds are driven explicitly, so convergence is
//! deterministic rather than wall-clock dependent.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use karst_consensus::score::is_better_chain;
use karst_core::chain_config::ChainConfig;
use karst_node_lib::NodeConfig;
use karst_sync::SyncRoundOutcome;
use karst_tests::helpers::{wait_until, ChainStats, TestNode};

const NETWORK_SIZE: usize = 10;

/// Seed `NETWORK_SIZE` nodes with random-length chains (1 to 123 blocks)
/// and distinct block times, returning the nodes and the best seeded
/// chain's stats.
async fn seed_network() -> (Vec<TestNode>, ChainStats) {
    let mut rng = StdRng::seed_from_u64(0x4B41_5253);
    let mut nodes = Vec::with_capacity(NETWORK_SIZE);
    let mut best: Option<ChainStats> = None;

    for i in 0..NETWORK_SIZE {
        let node = TestNode::new(i as u64);
        let count = 1 + (rng.next_u32() % 123) as u64;
        let block_time_ms = 60_000 + i as u64 * 1_000;
        node.grow(count, block_time_ms).await;

        let stats = node.chain_stats();
        best = Some(match best {
            None => stats,
            Some(current)
                if is_better_chain(
                    (stats.score, &stats.tip_hash),
                    (current.score, &current.tip_hash),
                ) =>
            {
                stats
            }
            Some(current) => current,
        });
        nodes.push(node);
    }
    (nodes, best.expect("network is nonempty"))
}

/// Drive sync rounds (each node once per pass) until every node reports
/// the target stats, up to `max_passes`.
async fn drive_until_converged(nodes: &[TestNode], target: ChainStats, max_passes: usize) {
    for _ in 0..max_passes {
        if nodes.iter().all(|n| n.chain_stats() == target) {
            return;
        }
        for node in nodes {
            let before = node.node.chain_score();
            match node.node.run_sync_round().await {
                SyncRoundOutcome::Synchronized { .. } => {
                    // The adopted suffix strictly raises the score once the
                    // commit stage lands it.
                    wait_until(|| node.node.chain_score() > before).await;
                }
                SyncRoundOutcome::NoPeersAhead => {}
                other => panic!("unexpected sync outcome: {other:?}"),
            }
        }
    }
    for node in nodes {
        assert_eq!(
            node.chain_stats(),
            target,
            "node {} failed to converge",
            node.id,
        );
    }
}

#[tokio::test]
async fn dense_network_converges_on_best_chain() {
    let (nodes, best) = seed_network().await;

    // Fully connected: every node can pull from every other.
    for i in 0..nodes.len() {
        for j in 0..nodes.len() {
            if i != j {
                nodes[i].connect(&nodes[j]);
            }
        }
    }

    drive_until_converged(&nodes, best, 4).await;
    for node in &nodes {
        assert_eq!(node.chain_stats(), best);
    }
}

#[tokio::test]
async fn sparse_ring_converges_on_best_chain() {
    let (nodes, best) = seed_network().await;

    // Each node pulls only from its successor in the ring.
    for i in 0..nodes.len() {
        nodes[i].connect(&nodes[(i + 1) % nodes.len()]);
    }

    // The best chain needs up to a full lap to travel the ring.
    drive_until_converged(&nodes, best, nodes.len() + 3).await;
    for node in &nodes {
        assert_eq!(node.chain_stats(), best);
    }
}

#[tokio::test]
async fn fork_beyond_rollback_limit_is_rejected_network_wide() {
    let tight = NodeConfig {
        chain: ChainConfig {
            importance_grouping: 4,
            max_rollback_blocks: 3,
            max_difficulty_blocks: 2,
            ..ChainConfig::default()
        },
        ..NodeConfig::default()
    };

    let local = TestNode::with_config(1, tight.clone());
    let remote = TestNode::with_config(2, tight);

    // The fork point is genesis; the local chain is max_rollback + 1 deep.
    local.grow(4, 90_000).await;
    remote.grow(6, 60_000).await;
    assert!(remote.node.chain_score() > local.node.chain_score());

    let before = local.chain_stats();
    local.connect(&remote);
    let outcome = local.node.run_sync_round().await;
    match outcome {
        SyncRoundOutcome::PeerIncompatible(peer) => assert_eq!(peer, remote.id),
        other => panic!("expected PeerIncompatible, got {other:?}"),
    }

    // No state mutation, and the peer stays blacklisted for the cool-off.
    assert_eq!(local.chain_stats(), before);
    let second = local.node.run_sync_round().await;
    assert!(matches!(second, SyncRoundOutcome::NoPeersAhead));
}

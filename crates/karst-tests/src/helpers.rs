//! Test node harness: in-process nodes wired through loopback transports.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use karst_core::clock::ManualClock;
use karst_core::genesis;
use karst_core::types::{PublicKey, Transaction, TransactionBody};
use karst_node_lib::{KarstNode, NodeConfig};
use karst_pipeline::{CompletionStatus, ProcessingCompleteFn};
use karst_sync::{ChainApi, LoopbackIo, PeerId, RemoteChainApi};

/// A node plus the manual clock driving it.
pub struct TestNode {
    pub node: Arc<KarstNode>,
    pub clock: Arc<ManualClock>,
    pub id: PeerId,
}

impl TestNode {
    /// Build a node with the default config and all sixteen seed keys
    /// unlocked for harvesting.
    pub fn new(id: u64) -> Self {
        Self::with_config(id, NodeConfig::default())
    }

    pub fn with_config(id: u64, config: NodeConfig) -> Self {
        let clock = Arc::new(ManualClock::new(genesis::GENESIS_TIMESTAMP));
        let node = KarstNode::new(
            config,
            (0..genesis::SEED_ACCOUNT_COUNT).map(genesis::seed_key).collect(),
            Arc::clone(&clock) as Arc<dyn karst_core::clock::NetworkClock>,
            |_| {},
            Arc::new(|e| panic!("fatal node error: {e}")),
        )
        .expect("node config is valid");
        Self { node, clock, id: PeerId(id) }
    }

    /// Forge and commit `count` blocks spaced `block_time_ms` apart.
    pub async fn grow(&self, count: u64, block_time_ms: u64) {
        for _ in 0..count {
            let before = self.node.chain_height();
            self.clock.advance(block_time_ms);
            self.node.run_harvest_round();
            wait_until(|| self.node.chain_height() == before + 1).await;
            // The completion callback clears the pending slot just after
            // the commit; the next round would be skipped until it does.
            wait_until(|| !self.node.is_harvest_pending()).await;
        }
    }

    /// A chain API speaking the packet protocol against `other`.
    pub fn api_to(other: &TestNode) -> Arc<dyn ChainApi> {
        Arc::new(RemoteChainApi::new(LoopbackIo::new(other.node.chain_api_server())))
    }

    /// Register `other` as a pull peer of this node.
    pub fn connect(&self, other: &TestNode) {
        self.node.connect_peer(other.id, Self::api_to(other));
    }

    /// The convergence tuple `(score, tip_hash, state_hash, height)`.
    pub fn chain_stats(&self) -> ChainStats {
        ChainStats {
            score: self.node.chain_score(),
            tip_hash: self.node.tip_hash(),
            state_hash: self.node.state_hash(),
            height: self.node.chain_height(),
        }
    }
}

/// The agreement fingerprint every node must converge on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainStats {
    pub score: karst_consensus::ChainScore,
    pub tip_hash: karst_core::types::Hash256,
    pub state_hash: karst_core::types::Hash256,
    pub height: u64,
}

/// Poll until `condition` holds; panic after ~5 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

/// A signed transfer from seed account `from`.
pub fn signed_transfer(from: u8, recipient: PublicKey, amount: u64, fee: u64) -> Transaction {
    let key = genesis::seed_key(from);
    let mut tx = Transaction {
        signer: key.public_key(),
        deadline: u64::MAX,
        max_fee: fee,
        body: TransactionBody::Transfer { recipient, amount },
        signature: vec![],
    };
    tx.signature = key.sign(&tx.unsigned_bytes().unwrap());
    tx
}

/// Sign an arbitrary transaction body for seed account `from`.
pub fn signed_tx(from: u8, body: TransactionBody) -> Transaction {
    let key = genesis::seed_key(from);
    let mut tx = Transaction {
        signer: key.public_key(),
        deadline: u64::MAX,
        max_fee: 0,
        body,
        signature: vec![],
    };
    tx.signature = key.sign(&tx.unsigned_bytes().unwrap());
    tx
}

/// A completion callback capturing its status into a shared slot.
pub fn capturing_completion() -> (ProcessingCompleteFn, Arc<Mutex<Option<CompletionStatus>>>) {
    let slot = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&slot);
    (Box::new(move |_, status| *captured.lock() = Some(status)), slot)
}

//! Full node composition.
//!
//! [`KarstNode`] wires the cache set, block storage, plugin registry,
//! pipeline dispatcher, harvester, and synchronizer together through the
//! server hooks, and exposes the scheduled tasks that drive the node.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use karst_cache::{BlockStorage, CacheSet, MemoryBlockStorage};
use karst_consensus::harvester::Harvester;
use karst_consensus::plugins::PluginRegistry;
use karst_consensus::score::{ChainScore, ScoreTracker};
use karst_consensus::scheduled_harvester::{
    ScheduledHarvesterTask, ScheduledHarvesterTaskOptions,
};
use karst_core::clock::NetworkClock;
use karst_core::crypto::KeyPair;
use karst_core::element::BlockElement;
use karst_core::error::KarstError;
use karst_core::genesis;
use karst_core::types::{Block, Hash256, Transaction};
use karst_core::ut_cache::UtCache;
use karst_pipeline::{ConsumerDispatcher, InputSource, PipelineDeps, ProcessingCompleteFn};
use karst_sync::{ChainApi, ChainApiServer, ChainSynchronizer, PeerId, SyncRoundOutcome};

use crate::config::NodeConfig;
use crate::hooks::ServerHooks;
use crate::scheduler::{ScheduledTask, SchedulerHandle, TaskFuture, TaskScheduler};

type PeerList = Arc<RwLock<Vec<(PeerId, Arc<dyn ChainApi>)>>>;

/// A running full node (minus transports, which peers inject).
pub struct KarstNode {
    config: NodeConfig,
    caches: Arc<CacheSet>,
    storage: Arc<dyn BlockStorage>,
    ut_cache: Arc<UtCache>,
    score: Arc<ScoreTracker>,
    clock: Arc<dyn NetworkClock>,
    dispatcher: Arc<ConsumerDispatcher>,
    hooks: ServerHooks,
    harvester_task: ScheduledHarvesterTask,
    synchronizer: ChainSynchronizer,
    peers: PeerList,
}

impl KarstNode {
    /// Build a node. `configure_hooks` runs during boot, before the hook
    /// surface is sealed; use it to register extension sinks and
    /// predicates. `fatal_handler` receives unrecoverable errors (the
    /// binary aborts the process; tests usually panic).
    pub fn new(
        config: NodeConfig,
        harvesting_keys: Vec<KeyPair>,
        clock: Arc<dyn NetworkClock>,
        configure_hooks: impl FnOnce(&mut ServerHooks),
        fatal_handler: Arc<dyn Fn(&KarstError) + Send + Sync>,
    ) -> Result<Arc<Self>, KarstError> {
        config.validate()?;

        let caches = Arc::new(CacheSet::seeded(
            &genesis::seed_accounts(),
            config.chain.state_hash_enabled,
        ));
        let genesis_element = BlockElement::compute(genesis::genesis_block(), &genesis::genesis_hash())?;
        let storage: Arc<dyn BlockStorage> =
            Arc::new(MemoryBlockStorage::with_genesis(genesis_element.clone()));
        let ut_cache = Arc::new(UtCache::new());
        let registry = Arc::new(PluginRegistry::builtin());
        let score = Arc::new(ScoreTracker::new(ChainScore::ZERO));
        let peers: PeerList = Arc::new(RwLock::new(Vec::new()));

        let mut hooks = ServerHooks::new();
        configure_hooks(&mut hooks);

        let dispatcher = Arc::new(ConsumerDispatcher::new(PipelineDeps {
            caches: Arc::clone(&caches),
            storage: Arc::clone(&storage),
            registry: Arc::clone(&registry),
            config: config.chain.clone(),
            score: Arc::clone(&score),
            ut_cache: Arc::clone(&ut_cache),
            clock: Arc::clone(&clock),
            known_hash: {
                let predicate = hooks.known_hash_predicate(Arc::clone(&ut_cache));
                Arc::new(move |hash| predicate(hash))
            },
            new_block_sink: hooks.new_block_sink(),
            new_transactions_sink: hooks.new_transactions_sink(),
            fatal_handler,
            ring_size: 32,
        }));

        // Wire the single-assignment consumer factories to the dispatcher.
        {
            let submitter = Arc::clone(&dispatcher);
            hooks.set_block_range_consumer_factory(Arc::new(move |source| {
                let submitter = Arc::clone(&submitter);
                let consumer: crate::hooks::BlockRangeConsumer = Arc::new(move |blocks| {
                    let submitter = Arc::clone(&submitter);
                    tokio::spawn(async move {
                        submitter
                            .submit_blocks(blocks, source, Box::new(|_, _| {}))
                            .await;
                    });
                });
                consumer
            }))?;

            let submitter = Arc::clone(&dispatcher);
            hooks.set_completion_aware_block_range_consumer_factory(Arc::new(move |source| {
                let submitter = Arc::clone(&submitter);
                let consumer: crate::hooks::CompletionAwareBlockRangeConsumer =
                    Arc::new(move |blocks, completion: ProcessingCompleteFn| {
                        let submitter = Arc::clone(&submitter);
                        tokio::spawn(async move {
                            submitter.submit_blocks(blocks, source, completion).await;
                        });
                    });
                consumer
            }))?;

            let submitter = Arc::clone(&dispatcher);
            hooks.set_transaction_range_consumer_factory(Arc::new(move |source| {
                let submitter = Arc::clone(&submitter);
                let consumer: crate::hooks::TransactionRangeConsumer =
                    Arc::new(move |transactions| {
                        let submitter = Arc::clone(&submitter);
                        tokio::spawn(async move {
                            submitter
                                .submit_transactions(transactions, source, Box::new(|_, _| {}))
                                .await;
                        });
                    });
                consumer
            }))?;

            let retriever_peers = Arc::clone(&peers);
            hooks.set_remote_heights_retriever(Arc::new(move |count| {
                let sampled: Vec<(PeerId, Arc<dyn ChainApi>)> =
                    retriever_peers.read().iter().take(count).cloned().collect();
                Box::pin(async move {
                    let mut heights = Vec::new();
                    for (peer, api) in sampled {
                        match api.chain_info().await {
                            Ok(info) => heights.push(info.height),
                            Err(error) => debug!(%peer, %error, "height probe failed"),
                        }
                    }
                    heights
                })
            }))?;
        }

        let harvester = Harvester::new(
            harvesting_keys,
            config.chain.clone(),
            Arc::clone(&caches),
            Arc::clone(&ut_cache),
            Arc::clone(&registry),
        );
        let harvester_task = {
            let harvesting_enabled = config.harvesting_enabled;
            let chain_synced = hooks.chain_synced();
            let supplier_storage = Arc::clone(&storage);
            let fallback = Arc::new(genesis_element);
            let sampler_storage = Arc::clone(&storage);
            let sampler_config = config.chain.clone();
            let range_consumer = hooks
                .completion_aware_block_range_consumer_factory()?(InputSource::Local);
            ScheduledHarvesterTask::new(
                ScheduledHarvesterTaskOptions {
                    harvesting_allowed: Arc::new(move || harvesting_enabled && chain_synced()),
                    last_block_element_supplier: Arc::new(move || {
                        let tip = supplier_storage.chain_height();
                        supplier_storage
                            .load_block_element(tip)
                            .ok()
                            .flatten()
                            .map(Arc::new)
                            .unwrap_or_else(|| Arc::clone(&fallback))
                    }),
                    difficulty_sampler: Arc::new(move || {
                        difficulty_samples(sampler_storage.as_ref(), &sampler_config)
                    }),
                    time_supplier: Arc::clone(&clock),
                    range_consumer: Arc::new({
                        let consumer = range_consumer;
                        move |block: Block, handler| {
                            consumer(
                                vec![block],
                                Box::new(move |_, _| handler()),
                            );
                        }
                    }),
                },
                harvester,
            )
        };

        let synchronizer = ChainSynchronizer::new(
            Arc::clone(&storage),
            Arc::clone(&caches),
            Arc::clone(&registry),
            Arc::clone(&score),
            config.chain.clone(),
            Arc::clone(&clock),
            hooks.completion_aware_block_range_consumer_factory()?(InputSource::RemotePull),
        );

        Ok(Arc::new(Self {
            config,
            caches,
            storage,
            ut_cache,
            score,
            clock,
            dispatcher,
            hooks,
            harvester_task,
            synchronizer,
            peers,
        }))
    }

    // --- Peers ---

    /// Register a peer transport, respecting `max_connections`.
    pub fn connect_peer(&self, peer: PeerId, api: Arc<dyn ChainApi>) {
        let mut peers = self.peers.write();
        if peers.len() >= self.config.max_connections as usize {
            debug!(%peer, "connection limit reached; peer not registered");
            return;
        }
        peers.retain(|(existing, _)| *existing != peer);
        peers.push((peer, api));
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// The packet server answering this node's chain data to peers.
    pub fn chain_api_server(&self) -> Arc<ChainApiServer> {
        Arc::new(ChainApiServer::new(Arc::clone(&self.storage), Arc::clone(&self.score)))
    }

    // --- Driving rounds (also called by the scheduled tasks) ---

    /// One harvesting round.
    pub fn run_harvest_round(&self) {
        self.harvester_task.harvest();
    }

    /// One synchronization round over the registered peers.
    pub async fn run_sync_round(&self) -> SyncRoundOutcome {
        let peers = self.peers.read().clone();
        self.synchronizer.synchronize_round(&peers).await
    }

    /// One connect-peers round: probe registered peers so unreachable
    /// ones accrue failures before the synchronizer relies on them.
    pub async fn run_connect_round(&self) -> usize {
        let peers = self.peers.read().clone();
        let mut reachable = 0;
        for (peer, api) in peers {
            match api.chain_info().await {
                Ok(info) => {
                    debug!(%peer, height = info.height, "peer reachable");
                    reachable += 1;
                }
                Err(error) => debug!(%peer, %error, "peer probe failed"),
            }
        }
        reachable
    }

    /// Spawn the mandatory scheduled tasks.
    pub fn boot(self: &Arc<Self>) -> SchedulerHandle {
        let mut scheduler = TaskScheduler::new();
        let timings = &self.config.tasks;

        let node = Arc::clone(self);
        scheduler.add_task(ScheduledTask::new(
            "connect peers",
            Duration::from_millis(timings.connect_peers.start_delay_ms),
            Duration::from_millis(timings.connect_peers.repeat_delay_ms),
            Arc::new(move || {
                let node = Arc::clone(&node);
                Box::pin(async move {
                    node.run_connect_round().await;
                    Ok(())
                }) as TaskFuture
            }),
        ));

        let node = Arc::clone(self);
        scheduler.add_task(ScheduledTask::new(
            "synchronizer",
            Duration::from_millis(timings.synchronizer.start_delay_ms),
            Duration::from_millis(timings.synchronizer.repeat_delay_ms),
            Arc::new(move || {
                let node = Arc::clone(&node);
                Box::pin(async move {
                    node.run_sync_round().await;
                    Ok(())
                }) as TaskFuture
            }),
        ));

        let node = Arc::clone(self);
        scheduler.add_task(ScheduledTask::new(
            "harvesting",
            Duration::from_millis(timings.harvesting.start_delay_ms),
            Duration::from_millis(timings.harvesting.repeat_delay_ms),
            Arc::new(move || {
                let node = Arc::clone(&node);
                Box::pin(async move {
                    node.run_harvest_round();
                    Ok(())
                }) as TaskFuture
            }),
        ));

        info!(port = self.config.port, "node booted");
        scheduler.spawn()
    }

    /// Stop accepting pipeline inputs; queued ranges drain as aborted.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    // --- Submission entry points ---

    /// Submit a pushed block range.
    pub async fn push_blocks(
        &self,
        blocks: Vec<Block>,
        source: InputSource,
        completion: ProcessingCompleteFn,
    ) {
        self.dispatcher.submit_blocks(blocks, source, completion).await;
    }

    /// Submit a pushed transaction range.
    pub async fn push_transactions(
        &self,
        transactions: Vec<Transaction>,
        completion: ProcessingCompleteFn,
    ) {
        self.dispatcher
            .submit_transactions(transactions, InputSource::RemotePush, completion)
            .await;
    }

    // --- Inspection ---

    pub fn chain_height(&self) -> u64 {
        self.storage.chain_height()
    }

    pub fn chain_score(&self) -> ChainScore {
        self.score.current()
    }

    pub fn state_hash(&self) -> Hash256 {
        self.caches.state_hash()
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.storage
            .load_block_element(self.storage.chain_height())
            .ok()
            .flatten()
            .map(|element| element.entity_hash)
            .unwrap_or(Hash256::ZERO)
    }

    /// A read-only view pinned to the current committed state.
    pub fn state_view(&self) -> karst_cache::CacheView {
        self.caches.create_view()
    }

    pub fn hooks(&self) -> &ServerHooks {
        &self.hooks
    }

    pub fn ut_cache(&self) -> &Arc<UtCache> {
        &self.ut_cache
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network_time_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Whether a harvested block is still awaiting its terminal outcome.
    pub fn is_harvest_pending(&self) -> bool {
        self.harvester_task.is_pending()
    }
}

/// The trailing difficulty window ending at the stored tip.
pub fn difficulty_samples(
    storage: &dyn BlockStorage,
    config: &karst_core::chain_config::ChainConfig,
) -> Vec<(u64, u64)> {
    let tip = storage.chain_height();
    let start = tip.saturating_sub(config.max_difficulty_blocks.saturating_sub(1)).max(1);
    let mut samples = Vec::new();
    for height in start..=tip {
        if let Ok(Some(block)) = storage.load_block(height) {
            samples.push((block.timestamp, block.difficulty));
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    use karst_core::clock::ManualClock;
    use karst_sync::{LoopbackIo, RemoteChainApi};

    const HOUR_MS: u64 = 3_600_000;

    fn test_node(clock: Arc<ManualClock>) -> Arc<KarstNode> {
        KarstNode::new(
            NodeConfig::default(),
            (0..4).map(genesis::seed_key).collect(),
            clock,
            |_| {},
            Arc::new(|e| panic!("fatal: {e}")),
        )
        .unwrap()
    }

    fn clock_past_genesis(elapsed_ms: u64) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(genesis::GENESIS_TIMESTAMP + elapsed_ms))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn node_starts_at_genesis() {
        let node = test_node(clock_past_genesis(0));
        assert_eq!(node.chain_height(), 1);
        assert_eq!(node.chain_score(), ChainScore::ZERO);
        assert_eq!(node.tip_hash(), genesis::genesis_hash());
        assert!(!node.state_hash().is_zero());
    }

    #[tokio::test]
    async fn harvest_round_extends_the_chain() {
        let node = test_node(clock_past_genesis(HOUR_MS));
        node.run_harvest_round();
        wait_until(|| node.chain_height() == 2).await;
        assert!(node.chain_score() > ChainScore::ZERO);
        // The completion callback clears the pending slot shortly after.
        wait_until(|| !node.is_harvest_pending()).await;
    }

    #[tokio::test]
    async fn harvesting_disabled_forges_nothing() {
        let config = NodeConfig { harvesting_enabled: false, ..NodeConfig::default() };
        let node = KarstNode::new(
            config,
            (0..4).map(genesis::seed_key).collect(),
            clock_past_genesis(HOUR_MS),
            |_| {},
            Arc::new(|e| panic!("fatal: {e}")),
        )
        .unwrap();

        node.run_harvest_round();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.chain_height(), 1);
    }

    #[tokio::test]
    async fn chain_synced_predicate_gates_harvesting() {
        let node = KarstNode::new(
            NodeConfig::default(),
            (0..4).map(genesis::seed_key).collect(),
            clock_past_genesis(HOUR_MS),
            |hooks| hooks.set_chain_synced_predicate(Arc::new(|| false)),
            Arc::new(|e| panic!("fatal: {e}")),
        )
        .unwrap();

        node.run_harvest_round();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.chain_height(), 1);
    }

    #[tokio::test]
    async fn new_block_sinks_fire_on_commit() {
        let heights = Arc::new(Mutex::new(Vec::new()));
        let sink_heights = Arc::clone(&heights);
        let node = KarstNode::new(
            NodeConfig::default(),
            (0..4).map(genesis::seed_key).collect(),
            clock_past_genesis(HOUR_MS),
            move |hooks| {
                hooks.add_new_block_sink(Arc::new(move |element| {
                    sink_heights.lock().push(element.block.height);
                }));
            },
            Arc::new(|e| panic!("fatal: {e}")),
        )
        .unwrap();

        node.run_harvest_round();
        wait_until(|| node.chain_height() == 2).await;
        assert_eq!(*heights.lock(), vec![2]);
    }

    #[tokio::test]
    async fn nodes_converge_through_sync_rounds() {
        let clock_a = clock_past_genesis(0);
        let node_a = test_node(clock_a);

        let clock_b = clock_past_genesis(HOUR_MS);
        let node_b = test_node(Arc::clone(&clock_b));
        for _ in 0..3 {
            let before = node_b.chain_height();
            node_b.run_harvest_round();
            wait_until(|| node_b.chain_height() == before + 1).await;
            wait_until(|| !node_b.is_harvest_pending()).await;
            clock_b.advance(HOUR_MS);
        }
        assert_eq!(node_b.chain_height(), 4);

        node_a.connect_peer(
            PeerId(1),
            Arc::new(RemoteChainApi::new(LoopbackIo::new(node_b.chain_api_server()))),
        );
        let outcome = node_a.run_sync_round().await;
        assert!(matches!(outcome, SyncRoundOutcome::Synchronized { .. }));

        wait_until(|| node_a.chain_height() == node_b.chain_height()).await;
        assert_eq!(node_a.tip_hash(), node_b.tip_hash());
        assert_eq!(node_a.state_hash(), node_b.state_hash());
        assert_eq!(node_a.chain_score(), node_b.chain_score());
    }

    #[tokio::test]
    async fn connect_round_counts_reachable_peers() {
        let node_a = test_node(clock_past_genesis(0));
        let node_b = test_node(clock_past_genesis(0));
        node_a.connect_peer(
            PeerId(1),
            Arc::new(RemoteChainApi::new(LoopbackIo::new(node_b.chain_api_server()))),
        );
        assert_eq!(node_a.run_connect_round().await, 1);
    }

    #[tokio::test]
    async fn connection_limit_is_enforced() {
        let config = NodeConfig { max_connections: 2, ..NodeConfig::default() };
        let node = KarstNode::new(
            config,
            vec![],
            clock_past_genesis(0),
            |_| {},
            Arc::new(|e| panic!("fatal: {e}")),
        )
        .unwrap();
        let other = test_node(clock_past_genesis(0));

        for id in 0..5 {
            node.connect_peer(
                PeerId(id),
                Arc::new(RemoteChainApi::new(LoopbackIo::new(other.chain_api_server()))),
            );
        }
        assert_eq!(node.peer_count(), 2);
    }

    #[tokio::test]
    async fn scheduled_boot_drives_harvesting() {
        let config = NodeConfig {
            tasks: crate::config::TaskScheduleConfig {
                connect_peers: crate::config::TaskTiming::new(10, 50),
                synchronizer: crate::config::TaskTiming::new(10, 50),
                harvesting: crate::config::TaskTiming::new(10, 50),
            },
            ..NodeConfig::default()
        };
        let node = KarstNode::new(
            config,
            (0..4).map(genesis::seed_key).collect(),
            clock_past_genesis(HOUR_MS),
            |_| {},
            Arc::new(|e| panic!("fatal: {e}")),
        )
        .unwrap();
        let handle = node.boot();

        wait_until(|| node.chain_height() >= 2).await;
        handle.shutdown().await;
        node.shutdown();
    }

    #[tokio::test]
    async fn pushed_transactions_enter_the_unconfirmed_cache() {
        let node = test_node(clock_past_genesis(0));
        let key = genesis::seed_key(0);
        let mut tx = Transaction {
            signer: key.public_key(),
            deadline: u64::MAX,
            max_fee: 1,
            body: karst_core::types::TransactionBody::Transfer {
                recipient: karst_core::types::PublicKey([0x42; 32]),
                amount: 10,
            },
            signature: vec![],
        };
        tx.signature = key.sign(&tx.unsigned_bytes().unwrap());
        let hash = tx.entity_hash().unwrap();

        let done = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&done);
        node.push_transactions(
            vec![tx],
            Box::new(move |_, status| *captured.lock() = Some(status)),
        )
        .await;
        wait_until(|| done.lock().is_some()).await;
        assert!(node.ut_cache().contains(&hash));
    }
}

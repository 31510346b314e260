//! The staged dispatcher: a bounded ring of work items flowing through
//! filter/transform, validation, and commit tasks.
//!
//! Stages run as independent tasks connected by bounded channels, so
//! different inputs progress in parallel while each input visits the
//! stages strictly in order. Producers block (await) when the ring is
//! full; nothing is dropped silently. The commit task is the only writer
//! over the caches.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use karst_cache::{BlockStorage, CacheSet};
use karst_consensus::plugins::PluginRegistry;
use karst_consensus::score::ScoreTracker;
use karst_core::chain_config::ChainConfig;
use karst_core::clock::NetworkClock;
use karst_core::element::{BlockElement, TransactionInfo};
use karst_core::error::{KarstError, ValidationResult};
use karst_core::types::{Block, Hash256, Transaction};
use karst_core::ut_cache::UtCache;

use crate::commit::{CommitStage, NewBlockSink, NewTransactionsSink};
use crate::consumers::{
    assemble_block_elements, filter_known_blocks, filter_known_transactions, RecencySet,
    validate_block_stateless,
};
use crate::input::{AbortReason, CompletionStatus, InputSource, ProcessingCompleteFn};

/// Hashes remembered by the duplicate filter.
const RECENCY_CAPACITY: usize = 4_096;

/// Everything the pipeline needs wired in at boot.
pub struct PipelineDeps {
    pub caches: Arc<CacheSet>,
    pub storage: Arc<dyn BlockStorage>,
    pub registry: Arc<PluginRegistry>,
    pub config: ChainConfig,
    pub score: Arc<ScoreTracker>,
    pub ut_cache: Arc<UtCache>,
    pub clock: Arc<dyn NetworkClock>,
    /// The known-hash predicate (hook predicates OR unconfirmed cache).
    pub known_hash: Arc<dyn Fn(&Hash256) -> bool + Send + Sync>,
    pub new_block_sink: NewBlockSink,
    pub new_transactions_sink: NewTransactionsSink,
    /// Invoked on fatal invariant violations before the input is drained.
    pub fatal_handler: Arc<dyn Fn(&KarstError) + Send + Sync>,
    /// Capacity of each inter-stage ring segment.
    pub ring_size: usize,
}

enum Payload {
    Blocks { blocks: Vec<Block>, elements: Vec<BlockElement> },
    Transactions { transactions: Vec<Transaction>, infos: Vec<TransactionInfo> },
}

struct WorkItem {
    id: u64,
    source: InputSource,
    payload: Payload,
    completion: ProcessingCompleteFn,
}

impl WorkItem {
    fn complete(self, status: CompletionStatus) {
        (self.completion)(self.id, status);
    }
}

/// Handle for submitting ranges into the pipeline.
pub struct ConsumerDispatcher {
    ingest: mpsc::Sender<WorkItem>,
    next_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl ConsumerDispatcher {
    /// Spawn the stage tasks and return the submission handle.
    pub fn new(deps: PipelineDeps) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ingest_tx, ingest_rx) = mpsc::channel::<WorkItem>(deps.ring_size);
        let (validated_tx, validated_rx) = mpsc::channel::<WorkItem>(deps.ring_size);
        let (commit_tx, commit_rx) = mpsc::channel::<WorkItem>(deps.ring_size);

        tokio::spawn(filter_transform_task(
            ingest_rx,
            validated_tx,
            Arc::clone(&deps.storage),
            Arc::clone(&deps.known_hash),
            Arc::clone(&shutdown),
        ));
        tokio::spawn(validation_task(
            validated_rx,
            commit_tx,
            Arc::clone(&deps.registry),
            Arc::clone(&deps.clock),
            Arc::clone(&shutdown),
        ));

        let commit_stage = CommitStage {
            caches: deps.caches,
            storage: deps.storage,
            registry: deps.registry,
            config: deps.config,
            score: deps.score,
            ut_cache: deps.ut_cache,
            new_block_sink: deps.new_block_sink,
            new_transactions_sink: deps.new_transactions_sink,
        };
        tokio::spawn(commit_task(
            commit_rx,
            commit_stage,
            deps.fatal_handler,
            Arc::clone(&shutdown),
        ));

        Self { ingest: ingest_tx, next_id: AtomicU64::new(1), shutdown }
    }

    /// Submit a block range. Awaits when the ring is full; the returned id
    /// matches the one passed to the completion callback.
    pub async fn submit_blocks(
        &self,
        blocks: Vec<Block>,
        source: InputSource,
        completion: ProcessingCompleteFn,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let item = WorkItem {
            id,
            source,
            payload: Payload::Blocks { blocks, elements: Vec::new() },
            completion,
        };
        self.enqueue(item).await;
        id
    }

    /// Submit a transaction range.
    pub async fn submit_transactions(
        &self,
        transactions: Vec<Transaction>,
        source: InputSource,
        completion: ProcessingCompleteFn,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let item = WorkItem {
            id,
            source,
            payload: Payload::Transactions { transactions, infos: Vec::new() },
            completion,
        };
        self.enqueue(item).await;
        id
    }

    async fn enqueue(&self, item: WorkItem) {
        if self.shutdown.load(Ordering::SeqCst) {
            item.complete(CompletionStatus::Aborted(AbortReason::Shutdown));
            return;
        }
        if let Err(mpsc::error::SendError(item)) = self.ingest.send(item).await {
            item.complete(CompletionStatus::Aborted(AbortReason::Shutdown));
        }
    }

    /// Begin draining: every queued and future input completes with
    /// `Aborted(Shutdown)`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

async fn filter_transform_task(
    mut rx: mpsc::Receiver<WorkItem>,
    tx: mpsc::Sender<WorkItem>,
    storage: Arc<dyn BlockStorage>,
    known_hash: Arc<dyn Fn(&Hash256) -> bool + Send + Sync>,
    shutdown: Arc<AtomicBool>,
) {
    let mut block_recency = RecencySet::new(RECENCY_CAPACITY);
    let mut tx_recency = RecencySet::new(RECENCY_CAPACITY);

    while let Some(mut item) = rx.recv().await {
        if shutdown.load(Ordering::SeqCst) {
            item.complete(CompletionStatus::Aborted(AbortReason::Shutdown));
            continue;
        }
        let source = item.source;
        let outcome = match &mut item.payload {
            Payload::Blocks { blocks, elements } => {
                // Locally forged ranges are new by construction; only
                // remote submissions are dropped as duplicates.
                let filtered = match filter_known_blocks(blocks, &mut block_recency) {
                    Err(AbortReason::KnownHash) if source == InputSource::Local => Ok(()),
                    other => other,
                };
                match filtered
                    .and_then(|()| assemble_block_elements(std::mem::take(blocks), storage.as_ref()))
                {
                    Ok(assembled) => {
                        *elements = assembled;
                        Ok(())
                    }
                    Err(reason) => Err(reason),
                }
            }
            Payload::Transactions { transactions, infos } => {
                match filter_known_transactions(
                    std::mem::take(transactions),
                    &mut tx_recency,
                    known_hash.as_ref(),
                ) {
                    Ok(fresh) => {
                        *infos = fresh;
                        Ok(())
                    }
                    Err(reason) => Err(reason),
                }
            }
        };
        match outcome {
            Ok(()) => {
                if let Err(mpsc::error::SendError(item)) = tx.send(item).await {
                    item.complete(CompletionStatus::Aborted(AbortReason::Shutdown));
                }
            }
            Err(reason) => item.complete(CompletionStatus::Aborted(reason)),
        }
    }
}

async fn validation_task(
    mut rx: mpsc::Receiver<WorkItem>,
    tx: mpsc::Sender<WorkItem>,
    registry: Arc<PluginRegistry>,
    clock: Arc<dyn NetworkClock>,
    shutdown: Arc<AtomicBool>,
) {
    while let Some(item) = rx.recv().await {
        if shutdown.load(Ordering::SeqCst) {
            item.complete(CompletionStatus::Aborted(AbortReason::Shutdown));
            continue;
        }
        let failure = match &item.payload {
            Payload::Blocks { elements, .. } => elements.iter().find_map(|element| {
                match validate_block_stateless(element, &registry) {
                    ValidationResult::Failure(failure) => Some(failure),
                    _ => None,
                }
            }),
            Payload::Transactions { infos, .. } => {
                let now_ms = clock.now_ms();
                infos.iter().find_map(|info| {
                    match crate::consumers::validate_transaction_stateless(
                        &info.transaction,
                        now_ms,
                        &registry,
                    ) {
                        ValidationResult::Failure(failure) => Some(failure),
                        _ => None,
                    }
                })
            }
        };
        match failure {
            Some(failure) => {
                item.complete(CompletionStatus::Aborted(AbortReason::Validation(failure)))
            }
            None => {
                if let Err(mpsc::error::SendError(item)) = tx.send(item).await {
                    item.complete(CompletionStatus::Aborted(AbortReason::Shutdown));
                }
            }
        }
    }
}

async fn commit_task(
    mut rx: mpsc::Receiver<WorkItem>,
    stage: CommitStage,
    fatal_handler: Arc<dyn Fn(&KarstError) + Send + Sync>,
    shutdown: Arc<AtomicBool>,
) {
    while let Some(item) = rx.recv().await {
        if shutdown.load(Ordering::SeqCst) {
            item.complete(CompletionStatus::Aborted(AbortReason::Shutdown));
            continue;
        }
        let WorkItem { id, payload, completion, .. } = item;
        let status = match payload {
            Payload::Blocks { elements, .. } => match stage.process_block_range(elements) {
                Ok(status) => status,
                Err(fatal) => {
                    error!("fatal error in commit stage: {fatal}");
                    fatal_handler(&fatal);
                    shutdown.store(true, Ordering::SeqCst);
                    CompletionStatus::Aborted(AbortReason::Shutdown)
                }
            },
            Payload::Transactions { infos, .. } => stage.process_transaction_range(infos),
        };
        if matches!(status, CompletionStatus::Aborted(_)) {
            warn!(input = id, "input dropped: {status:?}");
        }
        completion(id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    use karst_cache::MemoryBlockStorage;
    use karst_consensus::harvester::Harvester;
    use karst_consensus::score::ChainScore;
    use karst_core::clock::ManualClock;
    use karst_core::genesis;
    use karst_core::types::{PublicKey, TransactionBody};

    const HOUR_MS: u64 = 3_600_000;

    struct Harness {
        dispatcher: ConsumerDispatcher,
        caches: Arc<CacheSet>,
        storage: Arc<MemoryBlockStorage>,
        harvester: Harvester,
        completions: Arc<Mutex<Vec<(u64, CompletionStatus)>>>,
    }

    impl Harness {
        fn new() -> Self {
            let config = ChainConfig::default();
            let caches = Arc::new(CacheSet::seeded(&genesis::seed_accounts(), true));
            let genesis_element =
                BlockElement::compute(genesis::genesis_block(), &genesis::genesis_hash())
                    .unwrap();
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

            let known_ut = Arc::clone(&ut_cache);
            let dispatcher = ConsumerDispatcher::new(PipelineDeps {
                caches: Arc::clone(&caches),
                storage: Arc::clone(&storage) as Arc<dyn BlockStorage>,
                registry,
                config,
                score: Arc::new(ScoreTracker::new(ChainScore::ZERO)),
                ut_cache,
                clock: Arc::new(ManualClock::new(genesis::GENESIS_TIMESTAMP)),
                known_hash: Arc::new(move |hash| known_ut.contains(hash)),
                new_block_sink: Arc::new(|_| {}),
                new_transactions_sink: Arc::new(|_| {}),
                fatal_handler: Arc::new(|_| {}),
                ring_size: 8,
            });

            Self {
                dispatcher,
                caches,
                storage,
                harvester,
                completions: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn completion(&self) -> ProcessingCompleteFn {
            let completions = Arc::clone(&self.completions);
            Box::new(move |id, status| completions.lock().push((id, status)))
        }

        fn forge_next(&self) -> Block {
            let tip = self.storage.chain_height();
            let parent = self.storage.load_block_element(tip).unwrap().unwrap();
            let mut samples = Vec::new();
            for height in 1..=tip {
                let block = self.storage.load_block(height).unwrap().unwrap();
                samples.push((block.timestamp, block.difficulty));
            }
            self.harvester
                .harvest(&parent, parent.block.timestamp + HOUR_MS, &samples)
                .unwrap()
        }

        async fn wait_for_completions(&self, count: usize) {
            for _ in 0..200 {
                if self.completions.lock().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("timed out waiting for {count} completions");
        }
    }

    #[tokio::test]
    async fn valid_block_flows_to_commit() {
        let harness = Harness::new();
        let block = harness.forge_next();
        let id = harness
            .dispatcher
            .submit_blocks(vec![block], InputSource::Local, harness.completion())
            .await;
        harness.wait_for_completions(1).await;

        let completions = harness.completions.lock();
        assert_eq!(completions[0], (id, CompletionStatus::Consumed));
        assert_eq!(harness.caches.height(), 2);
    }

    #[tokio::test]
    async fn invalid_signature_is_dropped_before_commit() {
        let harness = Harness::new();
        let mut block = harness.forge_next();
        block.signature = vec![0u8; 64];
        let id = harness
            .dispatcher
            .submit_blocks(vec![block], InputSource::RemotePush, harness.completion())
            .await;
        harness.wait_for_completions(1).await;

        let completions = harness.completions.lock();
        assert_eq!(
            completions[0],
            (
                id,
                CompletionStatus::Aborted(AbortReason::Validation(
                    karst_core::error::ValidationFailure::SignatureInvalid,
                )),
            ),
        );
        assert_eq!(harness.caches.height(), 1);
    }

    #[tokio::test]
    async fn duplicate_submission_is_filtered() {
        let harness = Harness::new();
        let block = harness.forge_next();
        harness
            .dispatcher
            .submit_blocks(vec![block.clone()], InputSource::Local, harness.completion())
            .await;
        harness.wait_for_completions(1).await;
        harness
            .dispatcher
            .submit_blocks(vec![block], InputSource::RemotePush, harness.completion())
            .await;
        harness.wait_for_completions(2).await;

        let completions = harness.completions.lock();
        assert_eq!(completions[0].1, CompletionStatus::Consumed);
        assert_eq!(completions[1].1, CompletionStatus::Aborted(AbortReason::KnownHash));
    }

    #[tokio::test]
    async fn completion_fires_exactly_once_per_input() {
        let harness = Harness::new();
        for round in 1..=3 {
            let block = harness.forge_next();
            harness
                .dispatcher
                .submit_blocks(vec![block], InputSource::Local, harness.completion())
                .await;
            harness.wait_for_completions(round).await;
        }
        let completions = harness.completions.lock();
        assert_eq!(completions.len(), 3);
        let mut ids: Vec<u64> = completions.iter().map(|(id, _)| *id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3, "each input completed once, in order");
        assert_eq!(harness.caches.height(), 4);
    }

    #[tokio::test]
    async fn shutdown_drains_with_aborted_status() {
        let harness = Harness::new();
        harness.dispatcher.shutdown();
        let block = harness.forge_next();
        let id = harness
            .dispatcher
            .submit_blocks(vec![block], InputSource::Local, harness.completion())
            .await;
        harness.wait_for_completions(1).await;
        assert_eq!(
            harness.completions.lock()[0],
            (id, CompletionStatus::Aborted(AbortReason::Shutdown)),
        );
        assert_eq!(harness.caches.height(), 1);
    }

    #[tokio::test]
    async fn transactions_flow_into_unconfirmed_cache() {
        let harness = Harness::new();
        let key = genesis::seed_key(0);
        let mut tx = karst_core::types::Transaction {
            signer: key.public_key(),
            deadline: u64::MAX,
            max_fee: 1,
            body: TransactionBody::Transfer {
                recipient: PublicKey([0x42; 32]),
                amount: 50,
            },
            signature: vec![],
        };
        tx.signature = key.sign(&tx.unsigned_bytes().unwrap());

        harness
            .dispatcher
            .submit_transactions(vec![tx], InputSource::RemotePush, harness.completion())
            .await;
        harness.wait_for_completions(1).await;
        assert_eq!(harness.completions.lock()[0].1, CompletionStatus::Consumed);
    }
}

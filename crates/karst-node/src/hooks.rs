//! The server hook surface.
//!
//! A typed registration area written once at boot and read concurrently
//! afterward. Sink lists fan out to every registered consumer in
//! registration order (an empty list yields a no-op consumer);
//! single-assignment slots reject double-set and read-before-set; the
//! known-hash predicate ORs every added predicate with membership in the
//! unconfirmed-transactions cache.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use karst_core::element::{BlockElement, TransactionInfo};
use karst_core::error::HookError;
use karst_core::types::{Block, Hash256, Transaction};
use karst_core::ut_cache::UtCache;
use karst_pipeline::{InputSource, ProcessingCompleteFn};
use karst_sync::packets::Packet;

/// Mempool delta broadcast to change handlers.
#[derive(Clone, Debug, Default)]
pub struct TransactionsChangeInfo {
    pub added: Vec<TransactionInfo>,
    pub removed: Vec<Hash256>,
}

/// Out-of-band transaction events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionEvent {
    DependencyRemoved,
}

#[derive(Clone, Debug)]
pub struct TransactionEventData {
    pub entity_hash: Hash256,
    pub event: TransactionEvent,
}

pub type BlockRangeConsumer = Arc<dyn Fn(Vec<Block>) + Send + Sync>;
pub type BlockRangeConsumerFactory = Arc<dyn Fn(InputSource) -> BlockRangeConsumer + Send + Sync>;
pub type CompletionAwareBlockRangeConsumer =
    Arc<dyn Fn(Vec<Block>, ProcessingCompleteFn) + Send + Sync>;
pub type CompletionAwareBlockRangeConsumerFactory =
    Arc<dyn Fn(InputSource) -> CompletionAwareBlockRangeConsumer + Send + Sync>;
pub type TransactionRangeConsumer = Arc<dyn Fn(Vec<Transaction>) + Send + Sync>;
pub type TransactionRangeConsumerFactory =
    Arc<dyn Fn(InputSource) -> TransactionRangeConsumer + Send + Sync>;
pub type RemoteHeightsRetriever =
    Arc<dyn Fn(usize) -> Pin<Box<dyn Future<Output = Vec<u64>> + Send>> + Send + Sync>;
pub type ChainSyncedPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
pub type KnownHashPredicate = Arc<dyn Fn(&Hash256) -> bool + Send + Sync>;

/// An ordered fan-out list of consumers sharing an argument type.
pub struct SinkList<T: ?Sized> {
    sinks: Vec<Arc<dyn Fn(&T) + Send + Sync>>,
}

impl<T: ?Sized> SinkList<T> {
    fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Append a sink; it will be invoked after all earlier ones.
    pub fn add(&mut self, sink: Arc<dyn Fn(&T) + Send + Sync>) {
        self.sinks.push(sink);
    }

    /// A composite consumer invoking every sink in registration order.
    pub fn get(&self) -> Arc<dyn Fn(&T) + Send + Sync>
    where
        T: 'static,
    {
        let sinks = self.sinks.clone();
        Arc::new(move |argument| {
            for sink in &sinks {
                sink(argument);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// A slot that must be set exactly once before reading.
pub struct SingleAssignment<T> {
    name: &'static str,
    value: Option<T>,
}

impl<T: Clone> SingleAssignment<T> {
    fn new(name: &'static str) -> Self {
        Self { name, value: None }
    }

    pub fn set(&mut self, value: T) -> Result<(), HookError> {
        if self.value.is_some() {
            return Err(HookError::AlreadySet(self.name));
        }
        self.value = Some(value);
        Ok(())
    }

    pub fn get(&self) -> Result<T, HookError> {
        self.value.clone().ok_or(HookError::NotSet(self.name))
    }
}

/// All hooks a booting server wires together.
pub struct ServerHooks {
    new_block_sinks: SinkList<BlockElement>,
    new_transactions_sinks: SinkList<[TransactionInfo]>,
    packet_payload_sinks: SinkList<Packet>,
    transactions_change_handlers: SinkList<TransactionsChangeInfo>,
    transaction_event_handlers: SinkList<TransactionEventData>,

    block_range_consumer_factory: SingleAssignment<BlockRangeConsumerFactory>,
    completion_aware_block_range_consumer_factory:
        SingleAssignment<CompletionAwareBlockRangeConsumerFactory>,
    transaction_range_consumer_factory: SingleAssignment<TransactionRangeConsumerFactory>,
    remote_heights_retriever: SingleAssignment<RemoteHeightsRetriever>,

    chain_synced: ChainSyncedPredicate,
    known_hash_predicates: Vec<KnownHashPredicate>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self {
            new_block_sinks: SinkList::new(),
            new_transactions_sinks: SinkList::new(),
            packet_payload_sinks: SinkList::new(),
            transactions_change_handlers: SinkList::new(),
            transaction_event_handlers: SinkList::new(),
            block_range_consumer_factory: SingleAssignment::new("block_range_consumer_factory"),
            completion_aware_block_range_consumer_factory: SingleAssignment::new(
                "completion_aware_block_range_consumer_factory",
            ),
            transaction_range_consumer_factory: SingleAssignment::new(
                "transaction_range_consumer_factory",
            ),
            remote_heights_retriever: SingleAssignment::new("remote_heights_retriever"),
            chain_synced: Arc::new(|| true),
            known_hash_predicates: Vec::new(),
        }
    }

    // --- Sink lists ---

    pub fn add_new_block_sink(&mut self, sink: Arc<dyn Fn(&BlockElement) + Send + Sync>) {
        self.new_block_sinks.add(sink);
    }

    pub fn new_block_sink(&self) -> Arc<dyn Fn(&BlockElement) + Send + Sync> {
        self.new_block_sinks.get()
    }

    pub fn add_new_transactions_sink(
        &mut self,
        sink: Arc<dyn Fn(&[TransactionInfo]) + Send + Sync>,
    ) {
        self.new_transactions_sinks.add(sink);
    }

    pub fn new_transactions_sink(&self) -> Arc<dyn Fn(&[TransactionInfo]) + Send + Sync> {
        self.new_transactions_sinks.get()
    }

    pub fn add_packet_payload_sink(&mut self, sink: Arc<dyn Fn(&Packet) + Send + Sync>) {
        self.packet_payload_sinks.add(sink);
    }

    pub fn packet_payload_sink(&self) -> Arc<dyn Fn(&Packet) + Send + Sync> {
        self.packet_payload_sinks.get()
    }

    pub fn add_transactions_change_handler(
        &mut self,
        handler: Arc<dyn Fn(&TransactionsChangeInfo) + Send + Sync>,
    ) {
        self.transactions_change_handlers.add(handler);
    }

    pub fn transactions_change_handler(&self) -> Arc<dyn Fn(&TransactionsChangeInfo) + Send + Sync> {
        self.transactions_change_handlers.get()
    }

    pub fn add_transaction_event_handler(
        &mut self,
        handler: Arc<dyn Fn(&TransactionEventData) + Send + Sync>,
    ) {
        self.transaction_event_handlers.add(handler);
    }

    pub fn transaction_event_handler(&self) -> Arc<dyn Fn(&TransactionEventData) + Send + Sync> {
        self.transaction_event_handlers.get()
    }

    // --- Single-assignment factories and retrievers ---

    pub fn set_block_range_consumer_factory(
        &mut self,
        factory: BlockRangeConsumerFactory,
    ) -> Result<(), HookError> {
        self.block_range_consumer_factory.set(factory)
    }

    pub fn block_range_consumer_factory(&self) -> Result<BlockRangeConsumerFactory, HookError> {
        self.block_range_consumer_factory.get()
    }

    pub fn set_completion_aware_block_range_consumer_factory(
        &mut self,
        factory: CompletionAwareBlockRangeConsumerFactory,
    ) -> Result<(), HookError> {
        self.completion_aware_block_range_consumer_factory.set(factory)
    }

    pub fn completion_aware_block_range_consumer_factory(
        &self,
    ) -> Result<CompletionAwareBlockRangeConsumerFactory, HookError> {
        self.completion_aware_block_range_consumer_factory.get()
    }

    pub fn set_transaction_range_consumer_factory(
        &mut self,
        factory: TransactionRangeConsumerFactory,
    ) -> Result<(), HookError> {
        self.transaction_range_consumer_factory.set(factory)
    }

    pub fn transaction_range_consumer_factory(
        &self,
    ) -> Result<TransactionRangeConsumerFactory, HookError> {
        self.transaction_range_consumer_factory.get()
    }

    pub fn set_remote_heights_retriever(
        &mut self,
        retriever: RemoteHeightsRetriever,
    ) -> Result<(), HookError> {
        self.remote_heights_retriever.set(retriever)
    }

    pub fn remote_heights_retriever(&self) -> Result<RemoteHeightsRetriever, HookError> {
        self.remote_heights_retriever.get()
    }

    // --- Predicates ---

    /// Replace the chain-synced predicate (defaults to always-true).
    pub fn set_chain_synced_predicate(&mut self, predicate: ChainSyncedPredicate) {
        self.chain_synced = predicate;
    }

    pub fn chain_synced(&self) -> ChainSyncedPredicate {
        Arc::clone(&self.chain_synced)
    }

    pub fn add_known_hash_predicate(&mut self, predicate: KnownHashPredicate) {
        self.known_hash_predicates.push(predicate);
    }

    /// A hash is known iff any registered predicate claims it OR the
    /// unconfirmed-transactions cache contains it.
    pub fn known_hash_predicate(&self, ut_cache: Arc<UtCache>) -> KnownHashPredicate {
        let predicates = self.known_hash_predicates.clone();
        Arc::new(move |hash| {
            predicates.iter().any(|predicate| predicate(hash)) || ut_cache.contains(hash)
        })
    }
}

impl Default for ServerHooks {
    fn default() -> Self {
        Self::new()
    }
}
